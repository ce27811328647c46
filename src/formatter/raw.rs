//! Pass-through provider with optional per-direction scripts
//!
//! A script sees `raw_data` (the payload as a string) plus every metadata
//! field as globals and assigns its output to `result`:
//!
//! - a string becomes the new payload
//! - an object must carry `data` (the payload); `ignore: "true"` drops the
//!   message and every other key becomes metadata

use super::script::{ScriptRunner, SCRIPT_TIMEOUT};
use super::{Formatter, FormatterError, PROVIDER_RAW};
use crate::config::FormatterScript;
use crate::protocol::{value_to_string, Message, Metadata, KEY_MQTT_TOPIC};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const KEY_RAW_DATA: &str = "raw_data";
pub const KEY_DATA: &str = "data";
pub const KEY_IGNORE: &str = "ignore";

pub struct RawFormatter {
    adapter: String,
    scripts: FormatterScript,
    runner: Arc<dyn ScriptRunner>,
    timeout: Duration,
}

impl RawFormatter {
    pub fn new(
        adapter: impl Into<String>,
        scripts: FormatterScript,
        runner: Arc<dyn ScriptRunner>,
    ) -> Self {
        Self {
            adapter: adapter.into(),
            scripts,
            runner,
            timeout: SCRIPT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn script_input(message: &Message) -> Map<String, Value> {
        let mut input = Map::new();
        input.insert(KEY_RAW_DATA.to_string(), Value::String(message.payload_str()));
        for (key, value) in &message.metadata {
            input.insert(key.clone(), value.clone());
        }
        input
    }

    async fn execute_script(
        &self,
        script: &str,
        message: &Message,
    ) -> Result<Option<Message>, FormatterError> {
        let response = self
            .runner
            .run(script, Self::script_input(message), self.timeout)
            .await
            .map_err(|source| FormatterError::Script {
                adapter: self.adapter.clone(),
                source,
            })?;

        let mut out = Message {
            payload: Vec::new(),
            metadata: Metadata::new(),
            timestamp: message.timestamp,
        };

        match response {
            Value::String(data) => out.payload = data.into_bytes(),
            Value::Object(map) => {
                let mut found_data = false;
                for (key, value) in &map {
                    match key.as_str() {
                        KEY_DATA => {
                            found_data = true;
                            out.payload = value_to_string(value).into_bytes();
                        }
                        KEY_IGNORE => {
                            if value_to_string(value).trim().eq_ignore_ascii_case("true") {
                                debug!(adapter = %self.adapter, "Script asked to ignore message");
                                return Ok(None);
                            }
                        }
                        _ => {
                            out.metadata.insert(key.clone(), value.clone());
                        }
                    }
                }
                if !found_data {
                    return Err(FormatterError::MissingData {
                        adapter: self.adapter.clone(),
                        response: Value::Object(map).to_string(),
                    });
                }
            }
            Value::Null => {
                return Err(FormatterError::Script {
                    adapter: self.adapter.clone(),
                    source: super::ScriptError::Execution(
                        "script did not assign a result".to_string(),
                    ),
                })
            }
            other => out.payload = value_to_string(&other).into_bytes(),
        }

        Ok(Some(out))
    }
}

#[async_trait]
impl Formatter for RawFormatter {
    fn name(&self) -> &'static str {
        PROVIDER_RAW
    }

    async fn to_source_message(&self, message: Message) -> Result<Option<Message>, FormatterError> {
        if !self.scripts.to_source.is_empty() {
            return self.execute_script(&self.scripts.to_source, &message).await;
        }
        if message.is_empty() {
            return Ok(None);
        }
        Ok(Some(message))
    }

    async fn to_mqtt_message(&self, message: Message) -> Result<Option<Message>, FormatterError> {
        if message.is_empty() {
            return Ok(None);
        }
        if !self.scripts.to_mqtt.is_empty() {
            return self.execute_script(&self.scripts.to_mqtt, &message).await;
        }

        let mut out = Message::new(message.payload).with_meta(KEY_MQTT_TOPIC, "");
        out.timestamp = message.timestamp;
        Ok(Some(out))
    }
}
