//! Adapters: one source device bridged to one MQTT connection
//!
//! An [`AdapterService`] owns both devices, a queue per direction and the
//! reconnect state machine for each side. The [`AdapterStore`] starts and
//! stops every configured adapter.

pub mod service;
pub mod store;

pub use service::AdapterService;
pub use store::AdapterStore;

use std::fmt;

/// One end of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Mqtt,
}

impl Side {
    /// The side messages received on this side are delivered to
    pub fn opposite(self) -> Self {
        match self {
            Side::Source => Side::Mqtt,
            Side::Mqtt => Side::Source,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
