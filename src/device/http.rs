//! HTTP listener device
//!
//! Every inbound request becomes one message whose payload is a JSON
//! envelope describing the request. The device is receive only.

use super::{Device, DeviceError, DeviceFactory, EventSink, KIND_HTTP};
use crate::config::{de, decode_map, ConfigError, ConfigMap};
use crate::protocol::{ConnectionState, Message};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warp::http::{header, HeaderMap, Method, StatusCode};
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Reply};

const AUTH_REALM: &str = "Basic realm=\"Enter username and password\"";

#[derive(Clone, Deserialize)]
pub struct HttpConfig {
    /// `host:port`; a leading `:` binds every interface
    pub listen_address: String,
    #[serde(default, deserialize_with = "de::bool")]
    pub is_auth_enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConfig")
            .field("listen_address", &self.listen_address)
            .field("is_auth_enabled", &self.is_auth_enabled)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HttpConfig {
    pub fn from_map(map: &ConfigMap) -> Result<Self, DeviceError> {
        Ok(decode_map(KIND_HTTP, map)?)
    }

    pub async fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = self.listen_address.trim();
        let address = if address.starts_with(':') {
            format!("0.0.0.0{address}")
        } else {
            address.to_string()
        };
        tokio::net::lookup_host(&address)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                ConfigError::InvalidConfig(format!("invalid listen_address '{}'", self.listen_address))
            })
    }
}

/// Request description carried as the message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub method: String,
    pub remote_address: String,
    pub host: String,
    pub path: String,
    /// Only filled for POST, PUT, PATCH and DELETE
    pub body: String,
    pub query_parameters: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub timestamp: DateTime<Utc>,
}

fn carries_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

struct RequestContext {
    adapter: String,
    credentials: Option<(String, String)>,
    events: EventSink,
}

impl RequestContext {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some((username, password)) = &self.credentials else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .map(|decoded| decoded == format!("{username}:{password}"))
            .unwrap_or(false)
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    ctx: Arc<RequestContext>,
    method: Method,
    remote: Option<SocketAddr>,
    host: Option<String>,
    path: FullPath,
    query: Vec<(String, String)>,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Infallible> {
    if !ctx.authorized(&headers) {
        debug!(adapter = %ctx.adapter, path = path.as_str(), "Rejected unauthenticated request");
        let reply = warp::reply::with_header(
            warp::reply::with_status("401 Unauthorized", StatusCode::UNAUTHORIZED),
            header::WWW_AUTHENTICATE,
            AUTH_REALM,
        );
        return Ok(reply.into_response());
    }
    headers.remove(header::AUTHORIZATION);

    let mut query_parameters: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in query {
        query_parameters.entry(key).or_default().push(value);
    }

    let mut header_values: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        header_values
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let envelope = RequestEnvelope {
        body: if carries_body(&method) {
            String::from_utf8_lossy(&body).into_owned()
        } else {
            String::new()
        },
        method: method.to_string(),
        remote_address: remote.map(|a| a.to_string()).unwrap_or_default(),
        host: host.unwrap_or_default(),
        path: path.as_str().to_string(),
        query_parameters,
        headers: header_values,
        timestamp: Utc::now(),
    };

    match serde_json::to_vec(&envelope) {
        Ok(payload) => {
            ctx.events.message(Message::new(payload));
            Ok(StatusCode::OK.into_response())
        }
        Err(e) => {
            error!(adapter = %ctx.adapter, error = %e, "Failed to serialize request");
            Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

pub struct HttpDevice {
    adapter: String,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl HttpDevice {
    /// Bind the listener and start serving
    pub async fn start(
        adapter_name: &str,
        config: HttpConfig,
        events: EventSink,
    ) -> Result<Arc<Self>, DeviceError> {
        let addr = config.socket_addr().await?;
        info!(adapter = adapter_name, listen_address = %config.listen_address, "Opening HTTP listener");

        let ctx = Arc::new(RequestContext {
            adapter: adapter_name.to_string(),
            credentials: config
                .is_auth_enabled
                .then(|| (config.username.clone(), config.password.clone())),
            events: events.clone(),
        });
        let with_ctx = warp::any().map(move || Arc::clone(&ctx));

        let routes = with_ctx
            .and(warp::method())
            .and(warp::addr::remote())
            .and(warp::header::optional::<String>("host"))
            .and(warp::path::full())
            .and(warp::query::<Vec<(String, String)>>())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(handle_request);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (local_addr, serve) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, async move {
                let _ = shutdown_rx.changed().await;
            })
            .map_err(|e| DeviceError::ConnectionFailed(format!("{addr}: {e}")))?;

        let adapter = adapter_name.to_string();
        let stopped = shutdown_tx.subscribe();
        let server = tokio::spawn(async move {
            serve.await;
            if !*stopped.borrow() {
                warn!(adapter = %adapter, "HTTP listener stopped unexpectedly");
                events.status(ConnectionState::error("http listener stopped"));
            }
        });

        info!(adapter = adapter_name, %local_addr, "HTTP listener started");

        Ok(Arc::new(Self {
            adapter: adapter_name.to_string(),
            local_addr,
            shutdown_tx,
            server: Mutex::new(Some(server)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Device for HttpDevice {
    fn kind(&self) -> &'static str {
        KIND_HTTP
    }

    async fn write(&self, _message: &Message) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported {
            kind: KIND_HTTP,
            operation: "write",
        })
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.server.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(adapter = %self.adapter, "HTTP listener did not stop in time");
            }
        }
        info!(adapter = %self.adapter, "HTTP listener closed");
        Ok(())
    }
}

/// Starts [`HttpDevice`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFactory;

#[async_trait]
impl DeviceFactory for HttpFactory {
    fn kind(&self) -> &'static str {
        KIND_HTTP
    }

    async fn create(
        &self,
        adapter_name: &str,
        config: &ConfigMap,
        events: EventSink,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        let config = HttpConfig::from_map(config)?;
        let status = events.clone();
        let device = HttpDevice::start(adapter_name, config, events).await?;
        status.status(ConnectionState::up());
        Ok(device)
    }
}
