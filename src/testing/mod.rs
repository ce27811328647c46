//! Testing utilities
//!
//! Mock device factories that let adapters run without serial ports,
//! sockets or an MQTT broker.

pub mod mocks;

pub use mocks::*;
