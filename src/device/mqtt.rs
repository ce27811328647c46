//! MQTT broker device built on rumqttc (MQTT v5)
//!
//! The event loop is polled by a task owned by the device. On ConnAck the
//! configured topics are subscribed and `Up` is reported; on the first
//! connection error the task reports `Error` and stops polling, leaving
//! reconnection to the adapter.

use super::framer::pre_transmit_delay;
use super::{Device, DeviceError, DeviceFactory, EventSink, KIND_MQTT};
use crate::config::{de, decode_map, duration_or, parse_duration, ConfigError, ConfigMap};
use crate::protocol::{
    publish_topic, split_topic_list, ConnectionState, Message, KEY_MQTT_QOS, KEY_MQTT_TOPIC,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::{TlsConfiguration, Transport};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_TRANSMIT_PRE_DELAY: Duration = Duration::from_micros(1);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

#[derive(Clone, Default, Deserialize)]
pub struct MqttConfig {
    /// `tcp://`, `mqtt://`, `ssl://`, `tls://` or `mqtts://` URL
    pub broker: String,
    #[serde(default, deserialize_with = "de::bool")]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Comma separated topic filters
    #[serde(default)]
    pub subscribe: String,
    /// Comma separated publish roots
    #[serde(default)]
    pub publish: String,
    #[serde(default, deserialize_with = "de::u8")]
    pub qos: u8,
    #[serde(default, deserialize_with = "de::bool")]
    pub retain: bool,
    #[serde(default)]
    pub transmit_pre_delay: String,
    #[serde(default)]
    pub reconnect_delay: String,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("broker", &self.broker)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("username", &self.username)
            .field("subscribe", &self.subscribe)
            .field("publish", &self.publish)
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("transmit_pre_delay", &self.transmit_pre_delay)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

impl MqttConfig {
    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let config: MqttConfig = decode_map(KIND_MQTT, map)?;
        config.qos_level()?;
        config.endpoint()?;
        Ok(config)
    }

    pub fn qos_level(&self) -> Result<QoS, ConfigError> {
        qos_from_u8(self.qos)
            .ok_or_else(|| ConfigError::InvalidConfig(format!("invalid MQTT qos {}", self.qos)))
    }

    pub fn pre_delay(&self) -> Duration {
        duration_or(&self.transmit_pre_delay, DEFAULT_TRANSMIT_PRE_DELAY)
    }

    /// MQTT side reconnect delay, when configured and valid
    pub fn reconnect_delay(&self) -> Option<Duration> {
        parse_duration(&self.reconnect_delay)
            .ok()
            .filter(|d| !d.is_zero())
    }

    pub fn subscribe_topics(&self) -> Vec<String> {
        split_topic_list(&self.subscribe)
    }

    pub fn publish_roots(&self) -> Vec<String> {
        split_topic_list(&self.publish)
    }

    /// Host, port and whether TLS is used
    pub fn endpoint(&self) -> Result<(String, u16, bool), ConfigError> {
        let invalid = |reason: &str| {
            ConfigError::InvalidConfig(format!("invalid broker '{}': {reason}", self.broker))
        };
        let url = Url::parse(self.broker.trim()).map_err(|e| invalid(&e.to_string()))?;
        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
        Ok((host.to_string(), port, tls))
    }
}

pub fn qos_from_u8(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Build client options: random client id, persistent session, optional TLS
pub fn configure_mqtt_options(
    adapter_name: &str,
    config: &MqttConfig,
) -> Result<MqttOptions, ConfigError> {
    let (host, port, tls) = config.endpoint()?;
    let client_id = format!("{adapter_name}-{}", Uuid::new_v4().simple());

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_start(false);

    if !config.username.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }

    if tls {
        let transport = if config.insecure_skip_verify {
            Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(
                insecure::client_config(),
            )))
        } else {
            Transport::tls_with_default_config()
        };
        options.set_transport(transport);
    }

    Ok(options)
}

/// TLS client config that accepts any server certificate
mod insecure {
    use rumqttc::tokio_rustls::rustls;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;

    #[derive(Debug)]
    struct AcceptAnyCertificate;

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    pub fn client_config() -> ClientConfig {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth()
    }
}

/// What the poll task has seen so far
#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Connecting,
    Connected,
    Failed(String),
}

/// Routing decision for one event loop event
#[derive(Debug)]
enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(Message),
    Disconnected,
    Other,
}

fn route_mqtt_event(event: Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
        Event::Incoming(Packet::Publish(publish)) => {
            let topic = String::from_utf8_lossy(&publish.topic).into_owned();
            let message = Message::new(publish.payload.to_vec())
                .with_meta(KEY_MQTT_TOPIC, topic)
                .with_meta(KEY_MQTT_QOS, publish.qos as u8);
            EventRoute::MessageReceived(message)
        }
        Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
        _ => EventRoute::Other,
    }
}

/// QoS for an outgoing message: message metadata first, then config
fn outgoing_qos(message: &Message, fallback: QoS) -> QoS {
    message
        .metadata
        .get(KEY_MQTT_QOS)
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
        .and_then(|level| u8::try_from(level).ok())
        .and_then(qos_from_u8)
        .unwrap_or(fallback)
}

pub struct MqttDevice {
    adapter: String,
    client: AsyncClient,
    publish_roots: Vec<String>,
    subscribe_topics: Vec<String>,
    qos: QoS,
    retain: bool,
    tx_delay: Duration,
    shutdown_tx: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MqttDevice {
    #[allow(clippy::too_many_arguments)]
    async fn poll_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        topics: Vec<String>,
        qos: QoS,
        link_tx: watch::Sender<LinkState>,
        mut shutdown_rx: watch::Receiver<bool>,
        events: EventSink,
        adapter: String,
    ) {
        loop {
            let polled = tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(adapter = %adapter, "MQTT poller received close signal");
                    return;
                }
                polled = event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => match route_mqtt_event(event) {
                    EventRoute::ConnectionAcknowledged => {
                        for topic in &topics {
                            if let Err(e) = client.try_subscribe(topic.clone(), qos) {
                                error!(adapter = %adapter, topic = %topic, error = %e, "Failed to subscribe");
                            }
                        }
                        info!(adapter = %adapter, topics = ?topics, "MQTT connected");
                        link_tx.send_replace(LinkState::Connected);
                        events.status(ConnectionState::up());
                    }
                    EventRoute::MessageReceived(message) => {
                        if !events.message(message) {
                            return;
                        }
                    }
                    EventRoute::Disconnected => {
                        warn!(adapter = %adapter, "Broker sent disconnect");
                        link_tx.send_replace(LinkState::Failed("disconnected by broker".to_string()));
                        events.status(ConnectionState::error("disconnected by broker"));
                        return;
                    }
                    EventRoute::Other => {}
                },
                Err(e) => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    let reason = e.to_string();
                    error!(adapter = %adapter, error = %reason, "MQTT connection lost");
                    let was_connected = *link_tx.borrow() == LinkState::Connected;
                    link_tx.send_replace(LinkState::Failed(reason.clone()));
                    if was_connected {
                        events.status(ConnectionState::error(reason));
                    }
                    return;
                }
            }
        }
    }

    /// Wait for ConnAck, a connection failure or the timeout
    async fn wait_for_connection_confirmation(
        mut link_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                match &*link_rx.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Failed(reason) => {
                        return Err(DeviceError::ConnectionFailed(reason.clone()))
                    }
                    LinkState::Connecting => {}
                }
                if link_rx.changed().await.is_err() {
                    return Err(DeviceError::ConnectionFailed(
                        "connection task ended".to_string(),
                    ));
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(DeviceError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Device for MqttDevice {
    fn kind(&self) -> &'static str {
        KIND_MQTT
    }

    async fn write(&self, message: &Message) -> Result<(), DeviceError> {
        let qos = outgoing_qos(message, self.qos);
        let suffix = message.topic();

        for root in &self.publish_roots {
            pre_transmit_delay(self.tx_delay).await;
            let topic = publish_topic(root, suffix);
            debug!(adapter = %self.adapter, topic = %topic, "Publishing message");
            self.client
                .publish(topic, qos, self.retain, message.payload.clone())
                .await
                .map_err(|e| DeviceError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        for topic in &self.subscribe_topics {
            let _ = self.client.try_unsubscribe(topic.clone());
        }
        let disconnected = self.client.try_disconnect();
        // give the poller a moment to flush the disconnect packet
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.poller.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!(adapter = %self.adapter, "MQTT poller did not stop in time");
            }
        }
        info!(adapter = %self.adapter, "MQTT connection closed");

        if let Err(e) = disconnected {
            debug!(adapter = %self.adapter, error = %e, "Disconnect request not delivered");
        }
        Ok(())
    }
}

/// Connects [`MqttDevice`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttFactory;

#[async_trait]
impl DeviceFactory for MqttFactory {
    fn kind(&self) -> &'static str {
        KIND_MQTT
    }

    async fn create(
        &self,
        adapter_name: &str,
        config: &ConfigMap,
        events: EventSink,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        let config = MqttConfig::from_map(config)?;
        debug!(adapter = adapter_name, ?config, "MQTT config");

        let options = configure_mqtt_options(adapter_name, &config)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let qos = config.qos_level()?;
        let subscribe_topics = config.subscribe_topics();

        let (link_tx, link_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = tokio::spawn(
            MqttDevice::poll_loop(
                event_loop,
                client.clone(),
                subscribe_topics.clone(),
                qos,
                link_tx,
                shutdown_rx,
                events,
                adapter_name.to_string(),
            )
            .instrument(crate::device_span!(adapter = %adapter_name, kind = KIND_MQTT)),
        );

        if let Err(e) = MqttDevice::wait_for_connection_confirmation(link_rx, CONNECT_TIMEOUT).await
        {
            let _ = shutdown_tx.send(true);
            poller.abort();
            return Err(e);
        }

        Ok(Arc::new(MqttDevice {
            adapter: adapter_name.to_string(),
            client,
            publish_roots: config.publish_roots(),
            subscribe_topics,
            qos,
            retain: config.retain,
            tx_delay: config.pre_delay(),
            shutdown_tx,
            poller: Mutex::new(Some(poller)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> Result<MqttConfig, ConfigError> {
        MqttConfig::from_map(value.as_object().unwrap())
    }

    #[test]
    fn test_config_from_sample_values() {
        let config = config(json!({
            "broker": "tcp://192.168.10.21:1883",
            "subscribe": "in_rfm69/#, other/#",
            "publish": "out_rfm69",
            "qos": "1",
            "transmit_pre_delay": "0s",
            "reconnect_delay": "5s",
        }))
        .unwrap();
        assert_eq!(config.qos_level().unwrap(), QoS::AtLeastOnce);
        assert_eq!(config.subscribe_topics(), vec!["in_rfm69/#", "other/#"]);
        assert_eq!(config.publish_roots(), vec!["out_rfm69"]);
        assert_eq!(config.pre_delay(), Duration::ZERO);
        assert_eq!(config.reconnect_delay(), Some(Duration::from_secs(5)));
        assert_eq!(
            config.endpoint().unwrap(),
            ("192.168.10.21".to_string(), 1883, false)
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = config(json!({"broker": "mqtts://broker.local"})).unwrap();
        assert_eq!(config.endpoint().unwrap(), ("broker.local".to_string(), 8883, true));
        assert_eq!(config.qos_level().unwrap(), QoS::AtMostOnce);
        assert_eq!(config.pre_delay(), DEFAULT_TRANSMIT_PRE_DELAY);
        assert_eq!(config.reconnect_delay(), None);
        assert!(!config.retain);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(config(json!({"broker": "tcp://localhost:1883", "qos": 3})).is_err());
        assert!(config(json!({"broker": "http://localhost"})).is_err());
        assert!(config(json!({"broker": "not a url"})).is_err());
        assert!(config(json!({})).is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let config = config(json!({"broker": "tcp://h:1", "password": "hunter2"})).unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_options_use_unique_client_ids() {
        let config = config(json!({"broker": "ssl://h:8883", "insecure_skip_verify": true})).unwrap();
        let a = configure_mqtt_options("gw", &config).unwrap();
        let b = configure_mqtt_options("gw", &config).unwrap();
        assert!(a.client_id().starts_with("gw-"));
        assert_ne!(a.client_id(), b.client_id());
        assert_eq!(a.keep_alive(), KEEP_ALIVE);
    }

    #[test]
    fn test_outgoing_qos_prefers_message_metadata() {
        let plain = Message::new("x");
        assert_eq!(outgoing_qos(&plain, QoS::AtMostOnce), QoS::AtMostOnce);

        let tagged = Message::new("x").with_meta(KEY_MQTT_QOS, 2);
        assert_eq!(outgoing_qos(&tagged, QoS::AtMostOnce), QoS::ExactlyOnce);

        let as_string = Message::new("x").with_meta(KEY_MQTT_QOS, "1");
        assert_eq!(outgoing_qos(&as_string, QoS::AtMostOnce), QoS::AtLeastOnce);

        let invalid = Message::new("x").with_meta(KEY_MQTT_QOS, 9);
        assert_eq!(outgoing_qos(&invalid, QoS::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (tx, rx) = watch::channel(LinkState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send_replace(LinkState::Connected);
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        let result = MqttDevice::wait_for_connection_confirmation(rx, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_failure() {
        let (tx, rx) = watch::channel(LinkState::Connecting);
        tx.send_replace(LinkState::Failed("refused".to_string()));
        let result = MqttDevice::wait_for_connection_confirmation(rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DeviceError::ConnectionFailed(ref r)) if r == "refused"));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (_tx, rx) = watch::channel(LinkState::Connecting);
        let result = MqttDevice::wait_for_connection_confirmation(rx, Duration::from_millis(50)).await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("ConnAck"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_connect_refused_fails_fast() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (events, _rx) = EventSink::channel(1);
        let map = json!({"broker": format!("tcp://127.0.0.1:{port}")});
        let result = MqttFactory
            .create("gw", map.as_object().unwrap(), events)
            .await;
        assert!(matches!(result, Err(DeviceError::ConnectionFailed(_))));
    }

    #[test]
    fn test_route_publish_records_topic_and_qos() {
        use rumqttc::v5::mqttbytes::v5::Publish;
        let publish = Publish::new("in/1/2/0/3", QoS::AtLeastOnce, "5", None);
        match route_mqtt_event(Event::Incoming(Packet::Publish(publish))) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic(), Some("in/1/2/0/3"));
                assert_eq!(message.metadata.get(KEY_MQTT_QOS), Some(&json!(1)));
                assert_eq!(message.payload_str(), "5");
            }
            other => panic!("unexpected route {other:?}"),
        }
    }
}
