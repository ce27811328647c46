//! Mock devices for testing
//!
//! [`MockDeviceFactory`] stands in for a real transport kind in a
//! [`Registry`](crate::registry::Registry). Every device it creates records
//! what is written to it and lets the test push inbound messages and status
//! changes through the adapter's event channel.

use crate::config::ConfigMap;
use crate::device::{Device, DeviceError, DeviceFactory, EventSink};
use crate::protocol::{ConnectionState, Message};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Factory producing [`MockDevice`]s under a fixed kind name
#[derive(Debug)]
pub struct MockDeviceFactory {
    kind: &'static str,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
    report_on_create: Mutex<Option<ConnectionState>>,
    devices: Mutex<Vec<Arc<MockDevice>>>,
}

impl MockDeviceFactory {
    pub fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail_next: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            report_on_create: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `count` create calls fail with a connection error
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make the next successful create report `state` before it returns,
    /// like a link that drops right after the handshake
    pub async fn report_on_create(&self, state: ConnectionState) {
        *self.report_on_create.lock().await = Some(state);
    }

    /// Number of create calls so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn devices(&self) -> Vec<Arc<MockDevice>> {
        self.devices.lock().await.clone()
    }

    /// Most recently created device
    pub async fn latest(&self) -> Option<Arc<MockDevice>> {
        self.devices.lock().await.last().cloned()
    }

    /// Poll until at least `count` create calls happened
    pub async fn wait_for_attempts(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.attempts() >= count).await
    }
}

#[async_trait]
impl DeviceFactory for MockDeviceFactory {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn create(
        &self,
        _adapter_name: &str,
        config: &ConfigMap,
        events: EventSink,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeviceError::ConnectionFailed(format!(
                "mock {} connection refused",
                self.kind
            )));
        }

        if let Some(state) = self.report_on_create.lock().await.take() {
            events.status(state);
            // lets the adapter see the report before create returns
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let device = Arc::new(MockDevice {
            kind: self.kind,
            config: config.clone(),
            events,
            writes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        });
        self.devices.lock().await.push(Arc::clone(&device));
        Ok(device)
    }
}

/// In-memory device created by [`MockDeviceFactory`]
#[derive(Debug)]
pub struct MockDevice {
    kind: &'static str,
    config: ConfigMap,
    events: EventSink,
    writes: Mutex<Vec<Message>>,
    closed: AtomicBool,
    fail_writes: AtomicBool,
}

impl MockDevice {
    /// Deliver an inbound message as if it came off the wire
    pub fn emit_message(&self, message: Message) -> bool {
        self.events.message(message)
    }

    /// Report a connectivity change to the adapter
    pub fn emit_status(&self, state: ConnectionState) -> bool {
        self.events.status(state)
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Config map the device was created from
    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    pub async fn writes(&self) -> Vec<Message> {
        self.writes.lock().await.clone()
    }

    /// Poll until at least `count` messages were written
    pub async fn wait_for_writes(&self, count: usize, timeout: Duration) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let writes = self.writes().await;
            if writes.len() >= count || tokio::time::Instant::now() >= deadline {
                return writes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Device for MockDevice {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn write(&self, message: &Message) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeviceError::WriteFailed("mock write failure".to_string()));
        }
        self.writes.lock().await.push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
