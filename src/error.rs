//! Crate level error type
//!
//! Each layer has its own `thiserror` enum; [`BridgeError`] wraps them for
//! callers that cross layers (adapter construction, the CLI).

use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::formatter::FormatterError;
use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Formatter error: {0}")]
    Formatter(#[from] FormatterError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Adapter '{name}' error: {message}")]
    Adapter { name: String, message: String },
}

impl BridgeError {
    pub fn adapter<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self::Adapter {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Errors that retrying cannot fix
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Config(_)
                | BridgeError::Device(DeviceError::Config(_))
                | BridgeError::Device(DeviceError::UnknownKind(_))
                | BridgeError::Formatter(FormatterError::UnknownProvider(_))
                | BridgeError::Formatter(FormatterError::UnsupportedSource { .. })
        )
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
