//! Provider for the receive-only HTTP source

use super::{Formatter, FormatterError, PROVIDER_HTTP};
use crate::protocol::{Message, KEY_MQTT_TOPIC};
use async_trait::async_trait;

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFormatter;

#[async_trait]
impl Formatter for HttpFormatter {
    fn name(&self) -> &'static str {
        PROVIDER_HTTP
    }

    async fn to_source_message(&self, _message: Message) -> Result<Option<Message>, FormatterError> {
        Err(FormatterError::Unsupported {
            provider: PROVIDER_HTTP,
            direction: "to-source",
        })
    }

    async fn to_mqtt_message(&self, message: Message) -> Result<Option<Message>, FormatterError> {
        if message.is_empty() {
            return Ok(None);
        }
        let mut out = Message::new(message.payload).with_meta(KEY_MQTT_TOPIC, "");
        out.timestamp = message.timestamp;
        Ok(Some(out))
    }
}
