//! Raw TCP stream device
//!
//! Connects to `tcp://host:port`, frames inbound bytes with the splitter
//! and writes outbound payloads followed by the splitter.

use super::framer::{encode_frame, pre_transmit_delay, Framer, DEFAULT_SPLITTER, READ_BUFFER_SIZE};
use super::{Device, DeviceError, DeviceFactory, EventSink, KIND_ETHERNET};
use crate::config::{de, decode_map, duration_or, ConfigError, ConfigMap};
use crate::protocol::{ConnectionState, Message};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};
use url::Url;

pub const DEFAULT_TRANSMIT_PRE_DELAY: Duration = Duration::from_micros(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct EthernetConfig {
    /// `tcp://host:port`
    pub server: String,
    #[serde(default, deserialize_with = "de::splitter")]
    pub message_splitter: Option<u8>,
    #[serde(default)]
    pub transmit_pre_delay: String,
}

impl EthernetConfig {
    pub fn from_map(map: &ConfigMap) -> Result<Self, DeviceError> {
        Ok(decode_map(KIND_ETHERNET, map)?)
    }

    pub fn splitter(&self) -> u8 {
        self.message_splitter.unwrap_or(DEFAULT_SPLITTER)
    }

    pub fn pre_delay(&self) -> Duration {
        duration_or(&self.transmit_pre_delay, DEFAULT_TRANSMIT_PRE_DELAY)
    }

    /// Host and port from the server URL; only the tcp scheme is supported
    pub fn address(&self) -> Result<(String, u16), ConfigError> {
        let invalid = |reason: &str| {
            ConfigError::InvalidConfig(format!("invalid server '{}': {reason}", self.server))
        };
        let url = Url::parse(self.server.trim()).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "tcp" {
            return Err(invalid("scheme must be tcp"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port().ok_or_else(|| invalid("missing port"))?;
        Ok((host.to_string(), port))
    }
}

pub struct EthernetDevice {
    adapter: String,
    server: String,
    splitter: u8,
    tx_delay: Duration,
    writer: Mutex<Option<OwnedWriteHalf>>,
    shutdown_tx: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl EthernetDevice {
    async fn read_loop(
        mut stream: OwnedReadHalf,
        mut framer: Framer,
        mut shutdown_rx: watch::Receiver<bool>,
        events: EventSink,
        adapter: String,
        server: String,
    ) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!(adapter = %adapter, server = %server, "Ethernet reader received close signal");
                    return;
                }
                read = stream.read(&mut buf) => {
                    let reason = match read {
                        Ok(0) => "connection closed by peer".to_string(),
                        Ok(n) => {
                            for frame in framer.feed(&buf[..n]) {
                                if !events.message(Message::new(frame)) {
                                    return;
                                }
                            }
                            continue;
                        }
                        Err(e) => e.to_string(),
                    };
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    error!(adapter = %adapter, server = %server, error = %reason, "Error reading from ethernet device");
                    events.status(ConnectionState::error(reason));
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Device for EthernetDevice {
    fn kind(&self) -> &'static str {
        KIND_ETHERNET
    }

    async fn write(&self, message: &Message) -> Result<(), DeviceError> {
        if message.is_empty() {
            return Ok(());
        }

        pre_transmit_delay(self.tx_delay).await;

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(DeviceError::Closed)?;
        stream
            .write_all(&encode_frame(&message.payload, self.splitter))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let _ = self.shutdown_tx.send(true);

        let result = match self.writer.lock().await.take() {
            Some(mut stream) => stream.shutdown().await.map_err(DeviceError::Io),
            None => Ok(()),
        };

        if let Some(handle) = self.reader.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                debug!(adapter = %self.adapter, "Ethernet reader did not stop in time");
            }
        }

        info!(adapter = %self.adapter, server = %self.server, "Ethernet connection closed");
        result
    }
}

/// Connects [`EthernetDevice`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct EthernetFactory;

#[async_trait]
impl DeviceFactory for EthernetFactory {
    fn kind(&self) -> &'static str {
        KIND_ETHERNET
    }

    async fn create(
        &self,
        adapter_name: &str,
        config: &ConfigMap,
        events: EventSink,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        let config = EthernetConfig::from_map(config)?;
        let (host, port) = config.address()?;
        info!(adapter = adapter_name, server = %config.server, "Connecting to ethernet device");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| DeviceError::ConnectionFailed(format!("{}: connect timeout", config.server)))?
            .map_err(|e| DeviceError::ConnectionFailed(format!("{}: {e}", config.server)))?;
        let (read_half, write_half) = stream.into_split();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reader = tokio::spawn(
            EthernetDevice::read_loop(
                read_half,
                Framer::new(config.splitter()),
                shutdown_rx,
                events,
                adapter_name.to_string(),
                config.server.clone(),
            )
            .instrument(crate::device_span!(adapter = %adapter_name, kind = KIND_ETHERNET)),
        );

        Ok(Arc::new(EthernetDevice {
            adapter: adapter_name.to_string(),
            server: config.server.clone(),
            splitter: config.splitter(),
            tx_delay: config.pre_delay(),
            writer: Mutex::new(Some(write_half)),
            shutdown_tx,
            reader: Mutex::new(Some(reader)),
        }))
    }
}
