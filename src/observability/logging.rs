//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! - `json` - Structured JSON for log aggregation
//! - `pretty` - Human-readable with colors and indentation
//! - `compact` - Terminal-friendly, colors with minimal spacing
//!
//! ## Environment Variables
//!
//! Environment variables override the `[logger]` section of the config file.
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE
//! - `LOG_FORMAT`: json, pretty or compact
//! - `LOG_SPANS`: include span open/close events (true/false)
//! - `RUST_LOG`: full filter override (env_logger syntax)
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./mqtt-bridge run -c config.toml
//! ```

use crate::config::LoggerConfig;
use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are too chatty below warn
const QUIET_TARGETS: &[&str] = &["rumqttc", "hyper", "warp", "tokio", "tokio_cron_scheduler"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" | "WARNING" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    let mut filter = EnvFilter::new(level.to_string());
    for target in QUIET_TARGETS {
        if let Ok(directive) = format!("{target}=warn").parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Install the global subscriber. Later calls are ignored, which keeps
/// tests that each initialise logging from panicking.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    let result = match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events(include_spans));
            subscriber.with(fmt_layer).try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_ansi(true)
                .with_span_events(span_events(include_spans));
            subscriber.with(fmt_layer).try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_ansi(true)
                .with_target(false)
                .with_span_events(span_events(include_spans));
            subscriber.with(fmt_layer).try_init()
        }
    };

    if result.is_err() {
        tracing::debug!("Global logger already installed");
    }
}

/// Resolved logger settings: environment first, then config file, then defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl LogSettings {
    pub fn resolve(config: &LoggerConfig, verbosity: u8) -> Self {
        Self::resolve_with(config, verbosity, |key| env::var(key).ok())
    }

    fn resolve_with(
        config: &LoggerConfig,
        verbosity: u8,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let level = match verbosity {
            0 => lookup("LOG_LEVEL")
                .or_else(|| config.level.clone())
                .map(|l| parse_level(&l))
                .unwrap_or(Level::INFO),
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let format = lookup("LOG_FORMAT")
            .or_else(|| config.format.clone())
            .map(|f| LogFormat::parse(&f))
            .unwrap_or(LogFormat::Json);

        let include_spans = lookup("LOG_SPANS")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Self {
            level,
            format,
            include_spans,
        }
    }
}

/// Initialize logging from the environment and the config file's logger section
pub fn init_from_config(config: &LoggerConfig, verbosity: u8) {
    let settings = LogSettings::resolve(config, verbosity);
    init_logging(settings.level, settings.format, settings.include_spans);
}

/// Initialize logging from environment variables only
pub fn init_default_logging() {
    init_from_config(&LoggerConfig::default(), 0);
}

/// Span for work done on behalf of one adapter
#[macro_export]
macro_rules! adapter_span {
    ($($field:tt)*) => {
        tracing::info_span!("adapter", $($field)*)
    };
}

/// Span for a device's I/O loop
#[macro_export]
macro_rules! device_span {
    ($($field:tt)*) => {
        tracing::info_span!("device_io", $($field)*)
    };
}

pub use {adapter_span, device_span};
