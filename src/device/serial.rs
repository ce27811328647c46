//! Serial port device
//!
//! The port is opened with a short read timeout and read from a dedicated
//! OS thread, since `serialport` is blocking. The reader checks a close flag
//! between reads, so `close` completes within one read timeout.

use super::framer::{encode_frame, pre_transmit_delay, Framer, DEFAULT_SPLITTER, READ_BUFFER_SIZE};
use super::{Device, DeviceError, DeviceFactory, EventSink, KIND_SERIAL};
use crate::config::{de, decode_map, duration_or, ConfigError, ConfigMap};
use crate::protocol::{ConnectionState, Message};
use async_trait::async_trait;
use serde::Deserialize;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_TRANSMIT_PRE_DELAY: Duration = Duration::from_millis(1);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baud_rate", deserialize_with = "de::u32")]
    pub baud_rate: u32,
    #[serde(default, deserialize_with = "de::splitter")]
    pub message_splitter: Option<u8>,
    #[serde(default)]
    pub transmit_pre_delay: String,
}

impl SerialConfig {
    pub fn from_map(map: &ConfigMap) -> Result<Self, DeviceError> {
        let config: SerialConfig = decode_map(KIND_SERIAL, map)?;
        if config.port.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("serial port name is empty".to_string()).into());
        }
        Ok(config)
    }

    pub fn splitter(&self) -> u8 {
        self.message_splitter.unwrap_or(DEFAULT_SPLITTER)
    }

    pub fn pre_delay(&self) -> Duration {
        duration_or(&self.transmit_pre_delay, DEFAULT_TRANSMIT_PRE_DELAY)
    }
}

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

pub struct SerialDevice {
    adapter: String,
    port_name: String,
    splitter: u8,
    tx_delay: Duration,
    writer: SharedPort,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: EventSink,
}

impl SerialDevice {
    fn read_loop(
        mut port: Box<dyn SerialPort>,
        mut framer: Framer,
        closed: Arc<AtomicBool>,
        events: EventSink,
        adapter: String,
        port_name: String,
    ) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        while !closed.load(Ordering::Acquire) {
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    for frame in framer.feed(&buf[..n]) {
                        if !events.message(Message::new(frame)) {
                            debug!(adapter = %adapter, port = %port_name, "Adapter gone, stopping reader");
                            return;
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    if closed.load(Ordering::Acquire) {
                        break;
                    }
                    error!(adapter = %adapter, port = %port_name, error = %e, "Error reading from serial port");
                    events.status(ConnectionState::error(e.to_string()));
                    return;
                }
            }
        }
        info!(adapter = %adapter, port = %port_name, "Serial reader received close signal");
    }
}

/// Wait for the reader thread; false when it panicked
fn join_reader(handle: JoinHandle<()>, adapter: &str, port_name: &str) -> bool {
    match handle.join() {
        Ok(()) => true,
        Err(_) => {
            error!(adapter = %adapter, port = %port_name, "Serial reader thread panicked");
            false
        }
    }
}

#[async_trait]
impl Device for SerialDevice {
    fn kind(&self) -> &'static str {
        KIND_SERIAL
    }

    async fn write(&self, message: &Message) -> Result<(), DeviceError> {
        if message.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }

        pre_transmit_delay(self.tx_delay).await;

        let frame = encode_frame(&message.payload, self.splitter);
        let writer = Arc::clone(&self.writer);
        let result = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
            let port = guard
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;
            port.write_all(&frame)?;
            port.flush()
        })
        .await
        .map_err(|e| DeviceError::WriteFailed(e.to_string()))?;

        if let Err(e) = result {
            error!(adapter = %self.adapter, port = %self.port_name, error = %e, "Error writing to serial port");
            self.events.status(ConnectionState::error(e.to_string()));
            return Err(DeviceError::Io(e));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let writer = Arc::clone(&self.writer);
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let adapter = self.adapter.clone();
        let port_name = self.port_name.clone();

        let result = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let port = writer.lock().unwrap_or_else(PoisonError::into_inner).take();
            let flushed = match port {
                Some(mut port) => {
                    let flushed = port.flush();
                    if let Err(e) = &flushed {
                        error!(adapter = %adapter, port = %port_name, error = %e, "Error flushing serial port");
                    }
                    flushed
                }
                None => Ok(()),
            };
            // reader holds its own handle; the port is released when it exits
            if let Some(handle) = reader {
                join_reader(handle, &adapter, &port_name);
            }
            flushed
        })
        .await
        .map_err(|e| DeviceError::WriteFailed(e.to_string()))?;

        info!(adapter = %self.adapter, port = %self.port_name, "Serial port closed");
        result.map_err(DeviceError::Io)
    }
}

/// Opens [`SerialDevice`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialFactory;

#[async_trait]
impl DeviceFactory for SerialFactory {
    fn kind(&self) -> &'static str {
        KIND_SERIAL
    }

    async fn create(
        &self,
        adapter_name: &str,
        config: &ConfigMap,
        events: EventSink,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        let config = SerialConfig::from_map(config)?;
        debug!(adapter = adapter_name, ?config, "Source device config");
        info!(adapter = adapter_name, port = %config.port, baud_rate = config.baud_rate, "Opening serial port");

        let port_name = config.port.clone();
        let baud_rate = config.baud_rate;
        let (reader_port, writer_port) = tokio::task::spawn_blocking(move || {
            let port = serialport::new(&port_name, baud_rate)
                .timeout(READ_TIMEOUT)
                .open()?;
            let reader = port.try_clone()?;
            Ok::<_, serialport::Error>((reader, port))
        })
        .await
        .map_err(|e| DeviceError::ConnectionFailed(e.to_string()))?
        .map_err(|e| DeviceError::ConnectionFailed(format!("{}: {e}", config.port)))?;

        let closed = Arc::new(AtomicBool::new(false));
        let framer = Framer::new(config.splitter());
        let reader = {
            let closed = Arc::clone(&closed);
            let events = events.clone();
            let adapter = adapter_name.to_string();
            let port_name = config.port.clone();
            let span = crate::device_span!(adapter = %adapter_name, kind = KIND_SERIAL);
            std::thread::Builder::new()
                .name(format!("serial-{adapter_name}"))
                .spawn(move || {
                    let _entered = span.entered();
                    SerialDevice::read_loop(reader_port, framer, closed, events, adapter, port_name)
                })?
        };

        Ok(Arc::new(SerialDevice {
            adapter: adapter_name.to_string(),
            port_name: config.port.clone(),
            splitter: config.splitter(),
            tx_delay: config.pre_delay(),
            writer: Arc::new(Mutex::new(Some(writer_port))),
            closed,
            reader: Mutex::new(Some(reader)),
            events,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_join_reader_reports_panic() {
        let clean = std::thread::spawn(|| {});
        assert!(join_reader(clean, "gw", "/dev/null"));

        let panicked = std::thread::spawn(|| panic!("reader failed"));
        assert!(!join_reader(panicked, "gw", "/dev/null"));
    }

    #[test]
    fn test_config_defaults() {
        let config = SerialConfig::from_map(&map(json!({"type": "serial", "port": "/dev/ttyUSB0"}))).unwrap();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.splitter(), b'\n');
        assert_eq!(config.pre_delay(), DEFAULT_TRANSMIT_PRE_DELAY);
    }

    #[test]
    fn test_config_string_values() {
        let config = SerialConfig::from_map(&map(json!({
            "port": "/dev/ttyACM0",
            "baud_rate": "9600",
            "message_splitter": 59,
            "transmit_pre_delay": "10ms",
        })))
        .unwrap();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.splitter(), b';');
        assert_eq!(config.pre_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_config_bad_delay_uses_default() {
        let config = SerialConfig::from_map(&map(json!({"port": "/dev/x", "transmit_pre_delay": "later"}))).unwrap();
        assert_eq!(config.pre_delay(), DEFAULT_TRANSMIT_PRE_DELAY);
    }

    #[test]
    fn test_config_requires_port() {
        assert!(SerialConfig::from_map(&map(json!({"baud_rate": 9600}))).is_err());
        assert!(SerialConfig::from_map(&map(json!({"port": " "}))).is_err());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let (events, _rx) = EventSink::channel(1);
        let result = SerialFactory
            .create(
                "gw",
                &map(json!({"port": "/dev/does-not-exist-mqtt-bridge"})),
                events,
            )
            .await;
        assert!(matches!(result, Err(DeviceError::ConnectionFailed(_))));
    }
}
