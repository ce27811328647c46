//! Message model and topic helpers shared across the bridge
//!
//! This module defines the values that flow between devices, formatters and
//! queues, plus the naming rules for topics and adapter identifiers.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
