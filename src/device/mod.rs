//! Transport devices on either side of an adapter
//!
//! A device owns its own I/O task. Inbound messages and connectivity
//! changes are pushed to the adapter through an [`EventSink`]; the adapter
//! calls [`Device::write`] and [`Device::close`].
//!
//! Each device incarnation is tagged with a generation number so the
//! adapter can ignore events from a device it has already replaced.

pub mod ethernet;
pub mod framer;
pub mod http;
pub mod mqtt;
pub mod serial;

use crate::config::{ConfigError, ConfigMap};
use crate::protocol::{ConnectionState, Message};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use ethernet::EthernetFactory;
pub use framer::Framer;
pub use http::HttpFactory;
pub use mqtt::MqttFactory;
pub use serial::SerialFactory;

/// Device kind names used in `source.type` and the registry
pub const KIND_SERIAL: &str = "serial";
pub const KIND_ETHERNET: &str = "ethernet";
pub const KIND_HTTP: &str = "http";
pub const KIND_MQTT: &str = "mqtt";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Operation not supported by {kind} device: {operation}")]
    Unsupported {
        kind: &'static str,
        operation: &'static str,
    },
    #[error("Device is closed")]
    Closed,
    #[error("Unknown device type: '{0}'")]
    UnknownKind(String),
}

/// Something a device reports to its adapter
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Message(Message),
    Status(ConnectionState),
}

/// A [`DeviceEvent`] tagged with the generation of the device that sent it
#[derive(Debug, Clone)]
pub struct SideEvent {
    pub generation: u64,
    pub event: DeviceEvent,
}

/// Handle a device uses to report messages and status changes
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SideEvent>,
    generation: u64,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SideEvent>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Sink plus the receiver it feeds, mostly for tests
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<SideEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, generation), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the adapter has gone away
    pub fn message(&self, message: Message) -> bool {
        self.send(DeviceEvent::Message(message))
    }

    pub fn status(&self, state: ConnectionState) -> bool {
        self.send(DeviceEvent::Status(state))
    }

    fn send(&self, event: DeviceEvent) -> bool {
        self.tx
            .send(SideEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// A connected transport endpoint
#[async_trait]
pub trait Device: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Send one message out through the transport
    async fn write(&self, message: &Message) -> Result<(), DeviceError>;

    /// Stop the I/O task and release the transport
    async fn close(&self) -> Result<(), DeviceError>;
}

/// Creates connected devices of one kind
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Decode `config`, open the transport and start its I/O task. Returns
    /// only once the device is usable.
    async fn create(
        &self,
        adapter_name: &str,
        config: &ConfigMap,
        events: EventSink,
    ) -> Result<Arc<dyn Device>, DeviceError>;
}
