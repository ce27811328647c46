//! HTTP source bridged to a mock MQTT side, driven with a real HTTP client

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mqtt_bridge::device::http::RequestEnvelope;
use mqtt_bridge::device::HttpFactory;
use mqtt_bridge::testing::{wait_until, MockDeviceFactory};
use mqtt_bridge::{
    AdapterConfig, AdapterService, CronCoreScheduler, FormatterScript, Registry, Scheduler, Side,
    KEY_MQTT_TOPIC,
};
use serde_json::json;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn http_adapter(port: u16, auth: bool) -> AdapterConfig {
    AdapterConfig {
        name: "webhook".to_string(),
        enabled: true,
        reconnect_delay: "1h".to_string(),
        provider: "http".to_string(),
        source: json!({
            "type": "http",
            "listen_address": format!("127.0.0.1:{port}"),
            "is_auth_enabled": auth,
            "username": "bridge",
            "password": "s3cret",
        })
        .as_object()
        .cloned()
        .unwrap(),
        mqtt: json!({"broker": "tcp://localhost:1883", "publish": "hooks"})
            .as_object()
            .cloned()
            .unwrap(),
        formatter_script: FormatterScript::default(),
    }
}

async fn start(config: AdapterConfig) -> (Arc<AdapterService>, Arc<MockDeviceFactory>) {
    let mqtt = MockDeviceFactory::new("mqtt");
    let mut registry = Registry::with_builtin_providers().unwrap();
    registry.register_device(Arc::new(HttpFactory)).unwrap();
    registry.register_device(mqtt.clone()).unwrap();

    let core = CronCoreScheduler::start().await.unwrap();
    let service = AdapterService::new(&config, &registry, Scheduler::new(Arc::new(core))).unwrap();
    service.start().await;
    assert!(wait_until(WAIT, || service.status(Side::Source).is_up()).await);
    assert!(wait_until(WAIT, || service.status(Side::Mqtt).is_up()).await);
    (service, mqtt)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_request_is_published_as_envelope() {
    let port = free_port();
    let (service, mqtt) = start(http_adapter(port, false)).await;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/sensors/kitchen?unit=c&unit=f"))
        .header("x-probe", "1")
        .body("21.5")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let broker = mqtt.latest().await.unwrap();
    let writes = broker.wait_for_writes(1, WAIT).await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].topic(), Some(""));

    let envelope: RequestEnvelope = serde_json::from_slice(&writes[0].payload).unwrap();
    assert_eq!(envelope.method, "POST");
    assert_eq!(envelope.path, "/sensors/kitchen");
    assert_eq!(envelope.body, "21.5");
    assert_eq!(envelope.query_parameters["unit"], vec!["c", "f"]);
    assert_eq!(envelope.headers["x-probe"], vec!["1"]);
    assert!(envelope.remote_address.starts_with("127.0.0.1:"));

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_request_has_empty_body() {
    let port = free_port();
    let (service, mqtt) = start(http_adapter(port, false)).await;

    let response = reqwest::get(format!("http://127.0.0.1:{port}/ping")).await.unwrap();
    assert!(response.status().is_success());

    let broker = mqtt.latest().await.unwrap();
    let writes = broker.wait_for_writes(1, WAIT).await;
    let envelope: serde_json::Value = serde_json::from_slice(&writes[0].payload).unwrap();
    assert_eq!(envelope["method"], "GET");
    assert_eq!(envelope["body"], "");
    assert!(writes[0].metadata.contains_key(KEY_MQTT_TOPIC));

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_basic_auth_is_enforced() {
    let port = free_port();
    let (service, mqtt) = start(http_adapter(port, true)).await;
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/secure");

    let denied = client.post(&url).body("x").send().await.unwrap();
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(denied.headers().contains_key("www-authenticate"));

    let wrong = client
        .post(&url)
        .header("authorization", format!("Basic {}", STANDARD.encode("bridge:nope")))
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

    let allowed = client
        .post(&url)
        .basic_auth("bridge", Some("s3cret"))
        .body("ok")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), reqwest::StatusCode::OK);

    let broker = mqtt.latest().await.unwrap();
    let writes = broker.wait_for_writes(1, WAIT).await;
    assert_eq!(writes.len(), 1);
    let envelope: RequestEnvelope = serde_json::from_slice(&writes[0].payload).unwrap();
    assert_eq!(envelope.body, "ok");
    assert!(!envelope.headers.contains_key("authorization"));

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_closed_after_stop() {
    let port = free_port();
    let (service, _mqtt) = start(http_adapter(port, false)).await;
    service.stop().await;

    let result = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/"))
        .timeout(Duration::from_secs(2))
        .send()
        .await;
    assert!(result.is_err());
}
