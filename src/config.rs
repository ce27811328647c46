//! Bridge configuration
//!
//! The configuration file is TOML. Adapter level settings are typed; the
//! `source` and `mqtt` sections stay as string keyed maps until a device of
//! the matching kind decodes them into its own typed struct.

use crate::protocol::validate_adapter_name;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Reconnect delay used when an adapter's value cannot be parsed
pub const DEFAULT_RECONNECT_DELAY: &str = "30s";

/// Untyped per-device configuration, decoded at device construction
pub type ConfigMap = serde_json::Map<String, Value>;

/// Top level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

/// Logger section; environment variables take precedence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoggerConfig {
    /// error, warn, info, debug or trace
    pub level: Option<String>,
    /// json, pretty or compact
    pub format: Option<String>,
}

/// One source device bridged to one MQTT connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    /// Go style duration string, e.g. "30s"
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: String,
    /// Provider (formatter) name: raw, mysensors_v2 or http
    pub provider: String,
    #[serde(default)]
    pub source: ConfigMap,
    #[serde(default)]
    pub mqtt: ConfigMap,
    #[serde(default)]
    pub formatter_script: FormatterScript,
}

fn default_reconnect_delay() -> String {
    DEFAULT_RECONNECT_DELAY.to_string()
}

/// Optional scripts used by the raw provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FormatterScript {
    #[serde(default)]
    pub to_source: String,
    #[serde(default)]
    pub to_mqtt: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid adapter name: {0}")]
    InvalidAdapterName(String),
    #[error("Duplicate adapter name: {0}")]
    DuplicateAdapter(String),
    #[error("Invalid duration: '{0}'")]
    InvalidDuration(String),
    #[error("Invalid {kind} configuration: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid or duplicate adapter names
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for adapter in &self.adapters {
            validate_adapter_name(&adapter.name)
                .map_err(|e| ConfigError::InvalidAdapterName(format!("'{}': {e}", adapter.name)))?;
            if !seen.insert(adapter.name.as_str()) {
                return Err(ConfigError::DuplicateAdapter(adapter.name.clone()));
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Configuration printed by `generate-config`
    pub fn sample() -> Self {
        let source = json!({
            "type": "serial",
            "port": "/dev/ttyUSB0",
            "baud_rate": 115200,
            "transmit_pre_delay": "10ms",
        });
        let mqtt = json!({
            "broker": "tcp://192.168.10.21:1883",
            "insecure_skip_verify": false,
            "username": "",
            "password": "",
            "subscribe": "in_rfm69/#",
            "publish": "out_rfm69",
            "qos": 0,
            "transmit_pre_delay": "0s",
            "reconnect_delay": "5s",
        });

        Self {
            logger: LoggerConfig {
                level: Some("info".to_string()),
                format: Some("compact".to_string()),
            },
            adapters: vec![AdapterConfig {
                name: "my_first_adapter".to_string(),
                enabled: true,
                reconnect_delay: DEFAULT_RECONNECT_DELAY.to_string(),
                provider: "mysensors_v2".to_string(),
                source: as_map(source),
                mqtt: as_map(mqtt),
                formatter_script: FormatterScript::default(),
            }],
        }
    }
}

fn as_map(value: Value) -> ConfigMap {
    match value {
        Value::Object(map) => map,
        _ => ConfigMap::new(),
    }
}

impl AdapterConfig {
    /// Source device kind from the `type` key, lowercased
    pub fn source_type(&self) -> String {
        self.source
            .get(crate::protocol::KEY_TYPE)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_default()
    }
}

/// Decode an untyped config section into a typed struct
pub fn decode_map<T: DeserializeOwned>(kind: &str, map: &ConfigMap) -> Result<T, ConfigError> {
    serde_json::from_value(Value::Object(map.clone())).map_err(|source| ConfigError::Decode {
        kind: kind.to_string(),
        source,
    })
}

/// Parse a Go style duration: a sequence of decimal numbers with unit
/// suffixes ns, us (µs), ms, s, m, h. `"0"` is accepted without a unit.
///
/// # Examples
/// ```
/// use mqtt_bridge::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("1.5ms").unwrap(), Duration::from_micros(1500));
/// assert!(parse_duration("soon").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let text = input.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(invalid());
    }

    let mut nanos = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        nanos += value * scale;
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Parse a duration, falling back to `default` when empty or malformed
pub fn duration_or(input: &str, default: Duration) -> Duration {
    if input.trim().is_empty() {
        return default;
    }
    parse_duration(input).unwrap_or(default)
}

/// Lenient field decoders for hand written configs, which often quote numbers
pub mod de {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        Text(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Text(String),
    }

    pub fn u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => u32::try_from(n).map_err(D::Error::custom),
            NumberOrString::Text(s) => s.trim().parse().map_err(D::Error::custom),
        }
    }

    pub fn u8<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => u8::try_from(n).map_err(D::Error::custom),
            NumberOrString::Text(s) => s.trim().parse().map_err(D::Error::custom),
        }
    }

    pub fn bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match BoolOrString::deserialize(deserializer)? {
            BoolOrString::Bool(b) => Ok(b),
            BoolOrString::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" | "" => Ok(false),
                other => Err(D::Error::custom(format!("invalid boolean '{other}'"))),
            },
        }
    }

    /// Splitter byte given as a number (10) or a one character string ("\n")
    pub fn splitter<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
        match Option::<NumberOrString>::deserialize(deserializer)? {
            None => Ok(None),
            Some(NumberOrString::Number(n)) => u8::try_from(n).map(Some).map_err(D::Error::custom),
            Some(NumberOrString::Text(s)) => {
                let bytes = s.as_bytes();
                if bytes.len() == 1 {
                    Ok(Some(bytes[0]))
                } else {
                    Err(D::Error::custom(format!(
                        "message splitter must be a single byte, got '{s}'"
                    )))
                }
            }
        }
    }
}
