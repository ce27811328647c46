//! MQTT bridge
//!
//! Bridges serial, ethernet (TCP) and HTTP sources to an MQTT broker. Each
//! configured adapter pairs one source device with one MQTT connection and
//! a formatter that converts messages in both directions.
//!
//! # Overview
//!
//! - [`device`]: transports with their own I/O tasks (serial, ethernet, HTTP, MQTT)
//! - [`formatter`]: `raw` (optionally scripted), `mysensors_v2` and `http` providers
//! - [`queue`]: bounded per-direction queues with a single consumer
//! - [`scheduler`]: named recurring timers that drive reconnects
//! - [`adapter`]: the per-adapter reconnect state machine and the adapter store
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_bridge::formatter::MySensorsFormatter;
//!
//! let line = MySensorsFormatter::encode("gateway/12/1/1/0/2", "on").unwrap();
//! assert_eq!(line, "12;1;1;0;2;on");
//!
//! let (topic, payload) = MySensorsFormatter::decode("12;1;1;0;2;on").unwrap();
//! assert_eq!(topic, "12/1/1/0/2");
//! assert_eq!(payload, "on");
//! ```

pub mod adapter;
pub mod config;
pub mod device;
pub mod error;
pub mod formatter;
pub mod observability;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod testing;

pub use adapter::{AdapterService, AdapterStore, Side};
pub use config::{AdapterConfig, BridgeConfig, ConfigError, FormatterScript};
pub use error::{BridgeError, BridgeResult};
pub use protocol::*;
pub use registry::Registry;
pub use scheduler::{CronCoreScheduler, Scheduler};
