//! Adapter service: connects both sides and moves messages between them
//!
//! Each side runs the same reconnect procedure, either directly at start or
//! from a scheduler timer:
//!
//! 1. cancel any pending retry for the side
//! 2. return if the side is already up
//! 3. close the previous device, create a new one
//! 4. on success mark the side up, otherwise schedule another retry
//!
//! Timers do not call the procedure themselves: they post the side on a
//! request channel served by a worker task. A device reporting a non-up
//! status also schedules a retry. Inbound messages are formatted for the
//! opposite side and queued; each queue's consumer writes to its device only
//! while that side is up.

use super::Side;
use crate::config::{parse_duration, AdapterConfig, ConfigMap};
use crate::device::mqtt::MqttConfig;
use crate::device::{Device, DeviceEvent, DeviceFactory, EventSink, SideEvent, KIND_MQTT};
use crate::error::BridgeResult;
use crate::formatter::Formatter;
use crate::protocol::{
    adapter_prefix, mqtt_id, source_id, ConnectionState, Message, KEY_MQTT_QOS,
};
use crate::queue::{BoundedQueue, Enqueue};
use crate::registry::Registry;
use crate::scheduler::{Scheduler, Trigger};
use futures::future::{self, FutureExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Used when the adapter's `reconnect_delay` cannot be parsed
pub const FALLBACK_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Connection bookkeeping for one side of an adapter
struct SideState {
    /// Scheduler and queue id
    id: String,
    factory: Arc<dyn DeviceFactory>,
    config: ConfigMap,
    reconnect_delay: Duration,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    /// Bumped by every device status report
    status_epoch: AtomicU64,
    device: RwLock<Option<Arc<dyn Device>>>,
    connect_lock: Mutex<()>,
    /// Messages waiting to be written to this side's device
    queue: Arc<BoundedQueue>,
    events_tx: mpsc::UnboundedSender<SideEvent>,
}

impl SideState {
    fn new(
        id: String,
        factory: Arc<dyn DeviceFactory>,
        config: ConfigMap,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SideEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::disconnected());
        let queue = Arc::new(BoundedQueue::with_default_capacity(id.clone()));
        let side_state = Self {
            id,
            factory,
            config,
            reconnect_delay,
            state,
            generation: AtomicU64::new(0),
            status_epoch: AtomicU64::new(0),
            device: RwLock::new(None),
            connect_lock: Mutex::new(()),
            queue,
            events_tx,
        };
        (side_state, events_rx)
    }

    fn status(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn is_up(&self) -> bool {
        self.state.borrow().is_up()
    }
}

pub struct AdapterService {
    name: String,
    provider: String,
    formatter: Arc<dyn Formatter>,
    scheduler: Scheduler,
    source: SideState,
    mqtt: SideState,
    /// QoS stamped on every message written to the broker
    mqtt_qos: u8,
    receivers: Mutex<Vec<(Side, mpsc::UnboundedReceiver<SideEvent>)>>,
    reconnect_tx: mpsc::UnboundedSender<Side>,
    reconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<Side>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl AdapterService {
    /// Resolve the provider and both device kinds. Nothing is connected
    /// until [`start`](Self::start).
    pub fn new(
        config: &AdapterConfig,
        registry: &Registry,
        scheduler: Scheduler,
    ) -> BridgeResult<Arc<Self>> {
        let mut source_config = config.source.clone();
        let formatter = registry.create_formatter(
            &config.provider,
            &config.name,
            &config.formatter_script,
            &mut source_config,
        )?;
        let source_factory = registry.device_factory(&config.source_type())?;
        let mqtt_factory = registry.device_factory(KIND_MQTT)?;
        let mqtt_config = MqttConfig::from_map(&config.mqtt)?;

        let reconnect_delay = match parse_duration(&config.reconnect_delay) {
            Ok(delay) if !delay.is_zero() => delay,
            _ => {
                info!(
                    adapter = %config.name,
                    reconnect_delay = %config.reconnect_delay,
                    default = ?FALLBACK_RECONNECT_DELAY,
                    "Invalid reconnect delay, running with default"
                );
                FALLBACK_RECONNECT_DELAY
            }
        };
        let mqtt_reconnect_delay = mqtt_config.reconnect_delay().unwrap_or(reconnect_delay);

        let (source, source_rx) = SideState::new(
            source_id(&config.name),
            source_factory,
            source_config,
            reconnect_delay,
        );
        let (mqtt, mqtt_rx) = SideState::new(
            mqtt_id(&config.name),
            mqtt_factory,
            config.mqtt.clone(),
            mqtt_reconnect_delay,
        );

        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            name: config.name.clone(),
            provider: config.provider.clone(),
            formatter,
            scheduler,
            source,
            mqtt,
            mqtt_qos: mqtt_config.qos,
            receivers: Mutex::new(vec![(Side::Source, source_rx), (Side::Mqtt, mqtt_rx)]),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Current connection state of one side
    pub fn status(&self, side: Side) -> ConnectionState {
        self.side(side).status()
    }

    /// Receiver that sees every state change of one side
    pub fn watch_status(&self, side: Side) -> watch::Receiver<ConnectionState> {
        self.side(side).state.subscribe()
    }

    /// Messages waiting to be written to `side`
    pub fn queued(&self, side: Side) -> usize {
        self.side(side).queue.len()
    }

    pub fn reconnect_delay(&self, side: Side) -> Duration {
        self.side(side).reconnect_delay
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Source => &self.source,
            Side::Mqtt => &self.mqtt,
        }
    }

    /// Start event handling and queue consumers, then connect the MQTT side
    /// followed by the source side
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(adapter = %self.name, "Adapter already started");
            return;
        }
        info!(adapter = %self.name, provider = %self.provider, "Starting adapter");

        let receivers: Vec<_> = self.receivers.lock().await.drain(..).collect();
        let mut tasks = Vec::with_capacity(receivers.len() + 3);
        for (side, rx) in receivers {
            tasks.push(self.spawn_event_pump(side, rx));
        }
        if let Some(rx) = self.reconnect_rx.lock().await.take() {
            tasks.push(self.spawn_reconnect_worker(rx));
        }
        tasks.push(self.spawn_consumer(Side::Source));
        tasks.push(self.spawn_consumer(Side::Mqtt));
        self.tasks.lock().await.extend(tasks);

        self.reconnect(Side::Mqtt).await;
        self.reconnect(Side::Source).await;
    }

    /// Close both devices and discard queued messages
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(adapter = %self.name, "Stopping adapter");

        for side in [Side::Source, Side::Mqtt] {
            let state = self.side(side);
            // waits for an in-flight connect attempt to finish
            let _guard = state.connect_lock.lock().await;
            state.generation.fetch_add(1, Ordering::AcqRel);
            if let Some(device) = state.device.write().await.take() {
                if let Err(e) = device.close().await {
                    error!(adapter = %self.name, side = %side, error = %e, "Failed to close device");
                }
            }
            state.state.send_replace(ConnectionState::disconnected());
        }

        self.scheduler.unschedule_all(&adapter_prefix(&self.name)).await;

        self.source.queue.stop();
        self.mqtt.queue.stop();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(adapter = %self.name, "Adapter stopped");
    }

    /// Run the reconnect procedure for one side. Does nothing while the side
    /// is up or after the adapter was stopped.
    pub async fn reconnect(&self, side: Side) {
        let state = self.side(side);
        let _guard = state.connect_lock.lock().await;

        self.scheduler.unschedule(&state.id).await;
        if self.is_stopped() {
            return;
        }
        if state.is_up() {
            debug!(adapter = %self.name, side = %side, "Already connected, skipping reconnect");
            return;
        }

        // events from the device being replaced are ignored from here on
        let generation = state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(previous) = state.device.write().await.take() {
            if let Err(e) = previous.close().await {
                error!(adapter = %self.name, side = %side, error = %e, "Failed to close previous device");
            }
        }

        let events = EventSink::new(state.events_tx.clone(), generation);
        let epoch = state.status_epoch.load(Ordering::Acquire);
        match state.factory.create(&self.name, &state.config, events).await {
            Ok(device) => {
                *state.device.write().await = Some(device);
                // a report from the new device while it was connecting wins
                let marked_up = state.state.send_if_modified(|current| {
                    if state.status_epoch.load(Ordering::Acquire) != epoch {
                        return false;
                    }
                    *current = ConnectionState::up();
                    true
                });
                if !marked_up && !state.is_up() {
                    warn!(
                        adapter = %self.name,
                        side = %side,
                        status = %state.status().status,
                        "Device failed while connecting, retry pending"
                    );
                    return;
                }
                info!(
                    adapter = %self.name,
                    side = %side,
                    kind = state.factory.kind(),
                    generation,
                    "Connected"
                );
            }
            Err(e) => {
                error!(
                    adapter = %self.name,
                    side = %side,
                    error = %e,
                    reconnect_delay = ?state.reconnect_delay,
                    "Failed to connect"
                );
                self.schedule_reconnect(side).await;
            }
        }
    }

    async fn schedule_reconnect(&self, side: Side) {
        if self.is_stopped() {
            return;
        }
        let state = self.side(side);
        let requests = self.reconnect_tx.clone();
        let trigger: Trigger = Arc::new(move || {
            let _ = requests.send(side);
            future::ready(()).boxed()
        });

        if let Err(e) = self
            .scheduler
            .schedule_every(&state.id, state.reconnect_delay, trigger)
            .await
        {
            error!(
                adapter = %self.name,
                side = %side,
                id = %state.id,
                error = %e,
                "Failed to schedule reconnect"
            );
        }
    }

    /// Serve reconnect requests posted by timers, one attempt at a time
    fn spawn_reconnect_worker(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Side>,
    ) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(side) = rx.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.reconnect(side).await;
            }
        })
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        side: Side,
        mut rx: mpsc::UnboundedReceiver<SideEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        let span = crate::adapter_span!(adapter = %self.name, side = %side);
        tokio::spawn(
            async move {
                while let Some(event) = rx.recv().await {
                    let Some(service) = service.upgrade() else {
                        break;
                    };
                    service.handle_event(side, event).await;
                }
            }
            .instrument(span),
        )
    }

    async fn handle_event(&self, side: Side, event: SideEvent) {
        let current = self.side(side).generation.load(Ordering::Acquire);
        if event.generation != current {
            trace!(generation = event.generation, current, "Ignoring event from replaced device");
            return;
        }
        match event.event {
            DeviceEvent::Message(message) => self.on_message(side, message).await,
            DeviceEvent::Status(state) => self.on_status(side, state).await,
        }
    }

    /// Format a message received on `side` and queue it for the other side
    async fn on_message(&self, side: Side, message: Message) {
        debug!(adapter = %self.name, side = %side, message = %message, "Received message");
        let formatted = match side {
            Side::Source => self.formatter.to_mqtt_message(message).await,
            Side::Mqtt => self.formatter.to_source_message(message).await,
        };

        let target = self.side(side.opposite());
        match formatted {
            Ok(Some(message)) => {
                if target.queue.add(message) == Enqueue::Dropped {
                    debug!(adapter = %self.name, queue = %target.id, "Message not queued");
                }
            }
            Ok(None) => trace!(adapter = %self.name, side = %side, "Formatter dropped message"),
            Err(e) => error!(
                adapter = %self.name,
                provider = %self.provider,
                side = %side,
                error = %e,
                "Failed to format message"
            ),
        }
    }

    async fn on_status(&self, side: Side, state: ConnectionState) {
        let up = state.is_up();
        let reason = state.reason.clone();
        let side_state = self.side(side);
        side_state.status_epoch.fetch_add(1, Ordering::AcqRel);
        side_state.state.send_replace(state);

        if up {
            info!(adapter = %self.name, side = %side, "Device reported up");
            return;
        }
        warn!(adapter = %self.name, side = %side, reason = %reason, "Device reported failure");
        self.schedule_reconnect(side).await;
    }

    fn spawn_consumer(self: &Arc<Self>, side: Side) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        let queue = Arc::clone(&self.side(side).queue);
        queue.start_consumer(move |message| {
            let service = service.clone();
            async move {
                if let Some(service) = service.upgrade() {
                    service.deliver(side, message).await;
                }
            }
        })
    }

    /// Write a dequeued message to the device on `side`; dropped unless
    /// that side is up
    async fn deliver(&self, side: Side, mut message: Message) {
        let state = self.side(side);
        if !state.is_up() {
            debug!(adapter = %self.name, side = %side, "Side is not up, dropping message");
            return;
        }
        let Some(device) = state.device.read().await.clone() else {
            debug!(adapter = %self.name, side = %side, "No device, dropping message");
            return;
        };

        if side == Side::Mqtt {
            message.set_meta(KEY_MQTT_QOS, self.mqtt_qos);
        }
        trace!(adapter = %self.name, side = %side, message = %message, "Writing message");
        if let Err(e) = device.write(&message).await {
            error!(adapter = %self.name, side = %side, error = %e, "Failed to write message");
        }
    }
}

impl std::fmt::Debug for AdapterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterService")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("source", &self.source.status().status)
            .field("mqtt", &self.mqtt.status().status)
            .finish_non_exhaustive()
    }
}
