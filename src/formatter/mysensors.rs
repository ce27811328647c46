//! MySensors serial protocol v2 codec
//!
//! Source side: `node-id;child-sensor-id;command;ack;type;payload`
//! MQTT side: topic `.../node-id/child-sensor-id/command/ack/type`, payload as is

use super::{Formatter, FormatterError, PROVIDER_MYSENSORS_V2};
use crate::protocol::{Message, KEY_MQTT_TOPIC};
use async_trait::async_trait;
use tracing::warn;

/// Field separator on the wire
pub const FIELD_SEPARATOR: char = ';';
/// Frame terminator the provider forces on stream sources
pub const MESSAGE_SPLITTER: u8 = b'\n';

const TOPIC_FIELDS: usize = 5;
const WIRE_FIELDS: usize = TOPIC_FIELDS + 1;

#[derive(Debug, Clone)]
pub struct MySensorsFormatter {
    adapter: String,
}

impl MySensorsFormatter {
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
        }
    }

    /// Encode an MQTT topic and payload into one wire line (without splitter)
    pub fn encode(topic: &str, payload: &str) -> Result<String, FormatterError> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < TOPIC_FIELDS {
            return Err(FormatterError::InvalidTopic(topic.to_string()));
        }
        let mut fields = segments[segments.len() - TOPIC_FIELDS..].to_vec();
        fields.push(payload);
        Ok(fields.join(";"))
    }

    /// Decode one wire line into a topic and payload
    pub fn decode(line: &str) -> Result<(String, String), FormatterError> {
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if fields.len() != WIRE_FIELDS {
            return Err(FormatterError::InvalidPayload {
                payload: line.to_string(),
                fields: fields.len(),
            });
        }
        Ok((fields[..TOPIC_FIELDS].join("/"), fields[TOPIC_FIELDS].to_string()))
    }
}

#[async_trait]
impl Formatter for MySensorsFormatter {
    fn name(&self) -> &'static str {
        PROVIDER_MYSENSORS_V2
    }

    async fn to_source_message(&self, message: Message) -> Result<Option<Message>, FormatterError> {
        let topic = message.meta_string(KEY_MQTT_TOPIC).unwrap_or_default();
        let line = Self::encode(&topic, &message.payload_str()).map_err(|e| {
            warn!(adapter = %self.adapter, topic = %topic, "Invalid topic for mysensors message");
            e
        })?;

        Ok(Some(Message {
            payload: line.into_bytes(),
            metadata: message.metadata,
            timestamp: message.timestamp,
        }))
    }

    async fn to_mqtt_message(&self, message: Message) -> Result<Option<Message>, FormatterError> {
        let line = message.payload_str();
        let (topic, payload) = Self::decode(&line).map_err(|e| {
            warn!(adapter = %self.adapter, message = %line, "Invalid mysensors message format");
            e
        })?;

        let mut out = Message::new(payload).with_meta(KEY_MQTT_TOPIC, topic);
        out.timestamp = message.timestamp;
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn formatter() -> MySensorsFormatter {
        MySensorsFormatter::new("mys")
    }

    #[tokio::test]
    async fn test_to_source_uses_last_five_segments() {
        let input = Message::new("5").with_meta(KEY_MQTT_TOPIC, "a/1/2/0/3");
        let stamp = input.timestamp;
        let out = formatter().to_source_message(input).await.unwrap().unwrap();
        assert_eq!(out.payload_str(), "a;1;2;0;3;5");
        assert_eq!(out.timestamp, stamp);
        assert_eq!(out.topic(), Some("a/1/2/0/3"));

        let input = Message::new("on").with_meta(KEY_MQTT_TOPIC, "home/gw/12/1/1/0/2");
        let out = formatter().to_source_message(input).await.unwrap().unwrap();
        assert_eq!(out.payload_str(), "12;1;1;0;2;on");
    }

    #[tokio::test]
    async fn test_to_source_rejects_short_topic() {
        let input = Message::new("5").with_meta(KEY_MQTT_TOPIC, "a/b/c");
        let err = formatter().to_source_message(input).await.unwrap_err();
        assert!(matches!(err, FormatterError::InvalidTopic(t) if t == "a/b/c"));

        let err = formatter().to_source_message(Message::new("5")).await.unwrap_err();
        assert!(matches!(err, FormatterError::InvalidTopic(_)));
    }

    #[tokio::test]
    async fn test_to_mqtt_splits_fields() {
        let input = Message::new("1;2;0;3;5;X");
        let stamp = input.timestamp;
        let out = formatter().to_mqtt_message(input).await.unwrap().unwrap();
        assert_eq!(out.topic(), Some("1/2/0/3/5"));
        assert_eq!(out.payload_str(), "X");
        assert_eq!(out.timestamp, stamp);
    }

    #[tokio::test]
    async fn test_to_mqtt_rejects_wrong_field_count() {
        for line in ["1;2;0;3;5", "1;2;0;3;5;X;Y", ""] {
            let err = formatter().to_mqtt_message(Message::new(line)).await.unwrap_err();
            assert!(matches!(err, FormatterError::InvalidPayload { .. }), "{line}");
        }
    }

    #[tokio::test]
    async fn test_empty_payload_field_is_valid() {
        let out = formatter()
            .to_mqtt_message(Message::new("0;255;3;0;2;"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.topic(), Some("0/255/3/0/2"));
        assert!(out.is_empty());
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            segments in prop::collection::vec("[a-z0-9]{1,6}", 5),
            payload in "[^;]{0,32}",
        ) {
            let topic = segments.join("/");
            let line = MySensorsFormatter::encode(&topic, &payload).unwrap();
            let (decoded_topic, decoded_payload) = MySensorsFormatter::decode(&line).unwrap();
            prop_assert_eq!(decoded_topic, topic);
            prop_assert_eq!(decoded_payload, payload);
        }

        #[test]
        fn prop_short_topics_rejected(segments in prop::collection::vec("[a-z0-9]{1,6}", 0..5)) {
            let topic = segments.join("/");
            prop_assert!(MySensorsFormatter::encode(&topic, "x").is_err());
        }
    }
}
