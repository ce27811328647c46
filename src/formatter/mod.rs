//! Message transforms between the source wire format and MQTT
//!
//! A formatter converts in both directions. `Ok(None)` means the message is
//! intentionally dropped (empty payload, or a script asked to ignore it);
//! an error drops the message and is logged by the adapter.

pub mod http;
pub mod mysensors;
pub mod raw;
pub mod script;

use crate::protocol::Message;
use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpFormatter;
pub use mysensors::MySensorsFormatter;
pub use raw::RawFormatter;
pub use script::{BoaScriptRunner, ScriptError, ScriptRunner};

pub const PROVIDER_RAW: &str = "raw";
pub const PROVIDER_MYSENSORS_V2: &str = "mysensors_v2";
pub const PROVIDER_HTTP: &str = "http";

#[derive(Debug, Error)]
pub enum FormatterError {
    #[error("adapter '{adapter}': script failed: {source}")]
    Script {
        adapter: String,
        #[source]
        source: ScriptError,
    },
    #[error("adapter '{adapter}': key 'data' is not found in the script response {response}")]
    MissingData { adapter: String, response: String },
    #[error("invalid topic '{0}': at least 5 segments required")]
    InvalidTopic(String),
    #[error("invalid message format '{payload}': expected 6 fields, found {fields}")]
    InvalidPayload { payload: String, fields: usize },
    #[error("{provider} provider does not support {direction} messages")]
    Unsupported {
        provider: &'static str,
        direction: &'static str,
    },
    #[error("{provider} provider does not support source type '{source_type}'")]
    UnsupportedSource {
        provider: &'static str,
        source_type: String,
    },
    #[error("Unknown provider: '{0}'")]
    UnknownProvider(String),
}

/// Bidirectional message transform
#[async_trait]
pub trait Formatter: Send + Sync {
    fn name(&self) -> &'static str;

    /// MQTT message to the source wire format
    async fn to_source_message(&self, message: Message) -> Result<Option<Message>, FormatterError>;

    /// Source message to an MQTT topic/payload pair
    async fn to_mqtt_message(&self, message: Message) -> Result<Option<Message>, FormatterError>;
}
