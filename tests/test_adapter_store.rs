//! Adapter store behavior with mixed adapter configurations

use mqtt_bridge::testing::MockDeviceFactory;
use mqtt_bridge::{
    AdapterConfig, AdapterStore, CronCoreScheduler, FormatterScript, Message, Registry, Scheduler,
    Side, KEY_MQTT_TOPIC,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn adapter(name: &str, provider: &str, source_type: &str) -> AdapterConfig {
    AdapterConfig {
        name: name.to_string(),
        enabled: true,
        reconnect_delay: "1h".to_string(),
        provider: provider.to_string(),
        source: json!({"type": source_type})
            .as_object()
            .cloned()
            .unwrap(),
        mqtt: json!({"broker": "tcp://localhost:1883", "publish": format!("out/{name}")})
            .as_object()
            .cloned()
            .unwrap(),
        formatter_script: FormatterScript::default(),
    }
}

async fn store() -> (AdapterStore, Arc<MockDeviceFactory>, Arc<MockDeviceFactory>, Scheduler) {
    let serial = MockDeviceFactory::new("serial");
    let mqtt = MockDeviceFactory::new("mqtt");
    let mut registry = Registry::with_builtin_providers().unwrap();
    registry.register_device(serial.clone()).unwrap();
    registry.register_device(MockDeviceFactory::new("http")).unwrap();
    registry.register_device(mqtt.clone()).unwrap();

    let core = CronCoreScheduler::start().await.unwrap();
    let scheduler = Scheduler::new(Arc::new(core));
    (
        AdapterStore::new(Arc::new(registry), scheduler.clone()),
        serial,
        mqtt,
        scheduler,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_bad_adapter_does_not_block_the_rest() {
    let (store, serial, _mqtt, _scheduler) = store().await;
    let mut scripted = adapter("scripted", "raw", "serial");
    scripted.formatter_script.to_mqtt = "result = { data: raw_data.toUpperCase() }".to_string();
    let configs = vec![
        adapter("sensors", "mysensors_v2", "serial"),
        adapter("bad_source", "mysensors_v2", "http"),
        adapter("bad_kind", "raw", "carrier_pigeon"),
        scripted,
    ];

    assert_eq!(store.start(&configs).await, 2);
    assert_eq!(store.names().await, vec!["scripted", "sensors"]);

    let sensors = store.get("sensors").await.unwrap();
    assert!(sensors.status(Side::Source).is_up());
    assert!(sensors.status(Side::Mqtt).is_up());

    // The mysensors provider forces the newline splitter on its source
    let devices = serial.devices().await;
    assert!(devices
        .iter()
        .any(|d| d.config().get("message_splitter") == Some(&json!(10))));

    store.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_adapters_are_isolated_from_each_other() {
    let (store, serial, mqtt, _scheduler) = store().await;
    store
        .start(&[adapter("first", "raw", "serial"), adapter("second", "raw", "serial")])
        .await;

    let sources = serial.devices().await;
    let brokers = mqtt.devices().await;
    assert_eq!(sources.len(), 2);
    assert_eq!(brokers.len(), 2);

    sources[0].emit_message(Message::new("from first"));
    let writes = brokers[0].wait_for_writes(1, WAIT).await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].payload_str(), "from first");
    assert!(brokers[1].writes().await.is_empty());

    brokers[1].emit_message(Message::new("to second").with_meta(KEY_MQTT_TOPIC, "in/x"));
    let writes = sources[1].wait_for_writes(1, WAIT).await;
    assert_eq!(writes[0].payload_str(), "to second");
    assert!(sources[0].writes().await.is_empty());

    store.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replacing_an_adapter_stops_the_old_one() {
    let (store, serial, _mqtt, scheduler) = store().await;
    store.start(&[adapter("dup", "raw", "serial")]).await;
    let old = store.get("dup").await.unwrap();

    serial.fail_next(1);
    store.start(&[adapter("dup", "raw", "serial")]).await;
    let new = store.get("dup").await.unwrap();

    assert!(old.is_stopped());
    assert!(!new.is_stopped());
    assert_eq!(store.len().await, 1);
    assert_eq!(scheduler.ids().await, vec!["dup_adapter_source"]);

    store.close_all().await;
    assert!(scheduler.ids().await.is_empty());
}
