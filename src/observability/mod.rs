//! Observability: structured logging setup and span macros

pub mod logging;

pub use logging::{init_default_logging, init_from_config, init_logging, LogFormat, LogSettings};

// Span macros for structured logging
pub use logging::{adapter_span, device_span};
