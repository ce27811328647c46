//! Message and connection state types shared by every bridge component
//!
//! A [`Message`] is what flows through the pipeline: an opaque payload, a
//! metadata side channel (MQTT topic, QoS, HTTP headers, ...) and the time it
//! entered the bridge. A [`ConnectionState`] is the last status a device
//! reported for one side of an adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key carrying the MQTT topic (or topic suffix on publish)
pub const KEY_MQTT_TOPIC: &str = "mqtt_topic";
/// Metadata key carrying the MQTT QoS level
pub const KEY_MQTT_QOS: &str = "mqtt_qos";
/// Config key selecting the device kind of a source
pub const KEY_TYPE: &str = "type";

/// Ordered metadata map attached to every message
pub type Metadata = BTreeMap<String, Value>;

/// A unit of data moving between a source device and the MQTT broker
///
/// # Examples
/// ```
/// use mqtt_bridge::protocol::{Message, KEY_MQTT_TOPIC};
///
/// let message = Message::new("21.5").with_meta(KEY_MQTT_TOPIC, "kitchen/temp");
/// assert_eq!(message.topic(), Some("kitchen/temp"));
/// assert_eq!(message.payload_str(), "21.5");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Raw payload, never interpreted by queues or schedulers
    pub payload: Vec<u8>,
    /// Protocol specific side channel
    #[serde(default)]
    pub metadata: Metadata,
    /// When the message entered the bridge
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time and empty metadata
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder style metadata insert
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a metadata field
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Metadata field rendered as a string; strings are returned verbatim,
    /// other JSON values in their JSON form
    pub fn meta_string(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(value_to_string)
    }

    /// The MQTT topic metadata field, when it is a string
    pub fn topic(&self) -> Option<&str> {
        self.metadata.get(KEY_MQTT_TOPIC).and_then(Value::as_str)
    }

    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{payload:{}, metadata:{:?}, timestamp:{}}}",
            self.payload_str(),
            self.metadata,
            self.timestamp.to_rfc3339()
        )
    }
}

/// Render a JSON value the way it should appear inside a payload or topic
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Connectivity of one side of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No connection attempt has completed yet
    Disconnected,
    Up,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Disconnected => "disconnected",
            Status::Up => "up",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Last reported connectivity of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: Status,
    /// Error text for `Error`, empty otherwise
    pub reason: String,
    pub since: DateTime<Utc>,
}

impl ConnectionState {
    pub fn disconnected() -> Self {
        Self {
            status: Status::Disconnected,
            reason: String::new(),
            since: Utc::now(),
        }
    }

    pub fn up() -> Self {
        Self {
            status: Status::Up,
            reason: String::new(),
            since: Utc::now(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            reason: reason.into(),
            since: Utc::now(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == Status::Up
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected()
    }
}
