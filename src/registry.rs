//! Lookup of device factories and provider creators by name
//!
//! One [`Registry`] is built at startup and shared by every adapter.
//!
//! ```rust
//! use mqtt_bridge::config::{ConfigMap, FormatterScript};
//! use mqtt_bridge::protocol::{Message, KEY_MQTT_TOPIC};
//! use mqtt_bridge::Registry;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let registry = Registry::with_builtins().unwrap();
//! let mut source = ConfigMap::new();
//! source.insert("type".into(), json!("ethernet"));
//!
//! let formatter = registry
//!     .create_formatter("mysensors_v2", "gw", &FormatterScript::default(), &mut source)
//!     .unwrap();
//! assert_eq!(source["message_splitter"], json!(10));
//!
//! let out = formatter
//!     .to_mqtt_message(Message::new("12;1;1;0;0;21.5"))
//!     .await
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(out.metadata[KEY_MQTT_TOPIC], "12/1/1/0/0");
//! # });
//! ```

use crate::config::{ConfigMap, FormatterScript};
use crate::device::{
    DeviceError, DeviceFactory, EthernetFactory, HttpFactory, MqttFactory, SerialFactory,
    KIND_ETHERNET, KIND_SERIAL,
};
use crate::formatter::mysensors::MESSAGE_SPLITTER;
use crate::formatter::{
    BoaScriptRunner, Formatter, FormatterError, HttpFormatter, MySensorsFormatter, RawFormatter,
    ScriptRunner, PROVIDER_HTTP, PROVIDER_MYSENSORS_V2, PROVIDER_RAW,
};
use crate::protocol::KEY_TYPE;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Source config key the stream devices read their frame terminator from
pub const KEY_MESSAGE_SPLITTER: &str = "message_splitter";

/// Builds a formatter for one adapter. The creator may adjust the adapter's
/// source config (e.g. to force a frame terminator) before the source device
/// is created from it.
pub type ProviderCreator = Arc<
    dyn Fn(&ProviderContext, &mut ConfigMap) -> Result<Arc<dyn Formatter>, FormatterError>
        + Send
        + Sync,
>;

/// What a provider creator gets to know about its adapter
pub struct ProviderContext {
    pub adapter: String,
    pub script: FormatterScript,
    pub runner: Arc<dyn ScriptRunner>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate device kind registered: '{0}'")]
    DuplicateDevice(String),
    #[error("Duplicate provider registered: '{0}'")]
    DuplicateProvider(String),
}

pub struct Registry {
    devices: HashMap<String, Arc<dyn DeviceFactory>>,
    providers: HashMap<String, ProviderCreator>,
    runner: Arc<dyn ScriptRunner>,
}

impl Registry {
    /// Empty registry using the boa script runner
    pub fn new() -> Self {
        Self::with_runner(Arc::new(BoaScriptRunner))
    }

    pub fn with_runner(runner: Arc<dyn ScriptRunner>) -> Self {
        Self {
            devices: HashMap::new(),
            providers: HashMap::new(),
            runner,
        }
    }

    /// Registry with every built in device kind and provider
    pub fn with_builtins() -> Result<Self, RegistryError> {
        let mut registry = Self::with_builtin_providers()?;
        registry.register_device(Arc::new(SerialFactory))?;
        registry.register_device(Arc::new(EthernetFactory))?;
        registry.register_device(Arc::new(HttpFactory))?;
        registry.register_device(Arc::new(MqttFactory))?;
        Ok(registry)
    }

    /// Built in providers only; device factories are registered by the caller
    pub fn with_builtin_providers() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register_provider(PROVIDER_RAW, Arc::new(create_raw))?;
        registry.register_provider(PROVIDER_MYSENSORS_V2, Arc::new(create_mysensors))?;
        registry.register_provider(PROVIDER_HTTP, Arc::new(create_http))?;
        Ok(registry)
    }

    pub fn register_device(&mut self, factory: Arc<dyn DeviceFactory>) -> Result<(), RegistryError> {
        let kind = factory.kind().to_string();
        if self.devices.contains_key(&kind) {
            return Err(RegistryError::DuplicateDevice(kind));
        }
        debug!(kind = %kind, "Registered device factory");
        self.devices.insert(kind, factory);
        Ok(())
    }

    pub fn register_provider(
        &mut self,
        name: &str,
        creator: ProviderCreator,
    ) -> Result<(), RegistryError> {
        if self.providers.contains_key(name) {
            return Err(RegistryError::DuplicateProvider(name.to_string()));
        }
        debug!(provider = name, "Registered provider");
        self.providers.insert(name.to_string(), creator);
        Ok(())
    }

    /// Factory for a device kind, matched case-insensitively
    pub fn device_factory(&self, kind: &str) -> Result<Arc<dyn DeviceFactory>, DeviceError> {
        self.devices
            .get(&kind.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| DeviceError::UnknownKind(kind.to_string()))
    }

    /// Build the formatter for `provider`; may update `source`
    pub fn create_formatter(
        &self,
        provider: &str,
        adapter: &str,
        script: &FormatterScript,
        source: &mut ConfigMap,
    ) -> Result<Arc<dyn Formatter>, FormatterError> {
        let creator = self
            .providers
            .get(&provider.trim().to_lowercase())
            .ok_or_else(|| FormatterError::UnknownProvider(provider.to_string()))?;
        let ctx = ProviderContext {
            adapter: adapter.to_string(),
            script: script.clone(),
            runner: Arc::clone(&self.runner),
        };
        creator(&ctx, source)
    }

    /// Registered device kinds, sorted
    pub fn device_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.devices.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Registered provider names, sorted
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn create_raw(
    ctx: &ProviderContext,
    _source: &mut ConfigMap,
) -> Result<Arc<dyn Formatter>, FormatterError> {
    Ok(Arc::new(RawFormatter::new(
        ctx.adapter.clone(),
        ctx.script.clone(),
        Arc::clone(&ctx.runner),
    )))
}

/// MySensors gateways speak newline terminated lines over serial or TCP
fn create_mysensors(
    ctx: &ProviderContext,
    source: &mut ConfigMap,
) -> Result<Arc<dyn Formatter>, FormatterError> {
    let source_type = source
        .get(KEY_TYPE)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    if source_type != KIND_SERIAL && source_type != KIND_ETHERNET {
        return Err(FormatterError::UnsupportedSource {
            provider: PROVIDER_MYSENSORS_V2,
            source_type,
        });
    }
    source.insert(
        KEY_MESSAGE_SPLITTER.to_string(),
        Value::from(MESSAGE_SPLITTER),
    );
    Ok(Arc::new(MySensorsFormatter::new(ctx.adapter.clone())))
}

fn create_http(
    _ctx: &ProviderContext,
    _source: &mut ConfigMap,
) -> Result<Arc<dyn Formatter>, FormatterError> {
    Ok(Arc::new(HttpFormatter))
}
