//! MySensors gateway over TCP bridged to a mock MQTT side

use mqtt_bridge::device::EthernetFactory;
use mqtt_bridge::testing::{wait_until, MockDeviceFactory};
use mqtt_bridge::{
    AdapterConfig, AdapterService, CronCoreScheduler, FormatterScript, Message, Registry,
    Scheduler, Side, KEY_MQTT_QOS, KEY_MQTT_TOPIC,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

fn gateway_adapter(port: u16, reconnect_delay: &str) -> AdapterConfig {
    AdapterConfig {
        name: "gateway".to_string(),
        enabled: true,
        reconnect_delay: reconnect_delay.to_string(),
        provider: "mysensors_v2".to_string(),
        source: json!({"type": "ethernet", "server": format!("tcp://127.0.0.1:{port}")})
            .as_object()
            .cloned()
            .unwrap(),
        mqtt: json!({"broker": "tcp://localhost:1883", "qos": 1})
            .as_object()
            .cloned()
            .unwrap(),
        formatter_script: FormatterScript::default(),
    }
}

struct Bridge {
    service: Arc<AdapterService>,
    mqtt: Arc<MockDeviceFactory>,
    scheduler: Scheduler,
}

async fn bridge(config: AdapterConfig) -> Bridge {
    let mqtt = MockDeviceFactory::new("mqtt");
    let mut registry = Registry::with_builtin_providers().unwrap();
    registry.register_device(Arc::new(EthernetFactory)).unwrap();
    registry.register_device(mqtt.clone()).unwrap();

    let core = CronCoreScheduler::start().await.unwrap();
    let scheduler = Scheduler::new(Arc::new(core));
    let service = AdapterService::new(&config, &registry, scheduler.clone()).unwrap();
    Bridge {
        service,
        mqtt,
        scheduler,
    }
}

async fn accept(listener: &TcpListener) -> TcpStream {
    tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("gateway connection")
        .unwrap()
        .0
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gateway_lines_become_mqtt_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let b = bridge(gateway_adapter(port, "1h")).await;
    b.service.start().await;

    let mut gateway = accept(&listener).await;
    assert!(wait_until(WAIT, || b.service.status(Side::Source).is_up()).await);

    // Split across writes; the framer reassembles on '\n'
    gateway.write_all(b"12;1;1;0;").await.unwrap();
    gateway.write_all(b"0;21.5\n0;255;3;0;9;").await.unwrap();
    gateway.write_all(b"boot\nnot-a-mysensors-line\n").await.unwrap();

    let broker = b.mqtt.latest().await.unwrap();
    let writes = broker.wait_for_writes(2, WAIT).await;
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].topic(), Some("12/1/1/0/0"));
    assert_eq!(writes[0].payload_str(), "21.5");
    assert_eq!(writes[0].metadata[KEY_MQTT_QOS], 1);
    assert_eq!(writes[1].topic(), Some("0/255/3/0/9"));
    assert_eq!(writes[1].payload_str(), "boot");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.writes().await.len(), 2);

    b.service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mqtt_commands_reach_the_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let b = bridge(gateway_adapter(port, "1h")).await;
    b.service.start().await;

    let gateway = accept(&listener).await;
    assert!(wait_until(WAIT, || b.service.status(Side::Source).is_up()).await);

    let broker = b.mqtt.latest().await.unwrap();
    broker.emit_message(Message::new("1").with_meta(KEY_MQTT_TOPIC, "in_rfm69/12/3/1/0/2"));

    let mut lines = BufReader::new(gateway).lines();
    let line = tokio::time::timeout(WAIT, lines.next_line())
        .await
        .expect("line from bridge")
        .unwrap();
    assert_eq!(line.as_deref(), Some("12;3;1;0;2;1"));

    b.service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_gateway_is_reconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let b = bridge(gateway_adapter(port, "1s")).await;
    b.service.start().await;

    let first = accept(&listener).await;
    assert!(wait_until(WAIT, || b.service.status(Side::Source).is_up()).await);
    drop(first);

    let mut second = tokio::time::timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("bridge reconnects")
        .unwrap()
        .0;
    assert!(wait_until(WAIT, || b.service.status(Side::Source).is_up()).await);

    second.write_all(b"1;2;1;0;16;1\n").await.unwrap();
    let broker = b.mqtt.latest().await.unwrap();
    let writes = broker.wait_for_writes(1, WAIT).await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].topic(), Some("1/2/1/0/16"));

    b.service.stop().await;
    assert!(b.scheduler.ids().await.is_empty());
}
