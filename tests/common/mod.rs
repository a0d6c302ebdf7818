#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Request, Response};
use axum::Router;
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

use cli_relay::api::AppState;
use cli_relay::config::providers::{MemoryProviderRegistry, ProviderRegistry};
use cli_relay::config::{AppConfig, ConfigStore};

/// What a mock upstream saw.
#[derive(Debug, Clone)]
pub struct Captured {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Value,
}

#[derive(Clone, Default)]
pub struct Recorder {
    pub hits: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<Captured>>>,
}

impl Recorder {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Captured> {
        self.requests.lock().last().cloned()
    }

    pub async fn record(&self, request: Request<Body>) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let (parts, body) = request.into_parts();
        let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        self.requests.lock().push(Captured {
            path: parts.uri.path().to_string(),
            headers: parts.headers,
            body,
        });
    }
}

/// Serve `router` on an ephemeral port and return its base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// An address nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn state_with(registry: MemoryProviderRegistry, config: AppConfig) -> AppState {
    let settings = Arc::new(ConfigStore::in_memory(config));
    let registry: Arc<dyn ProviderRegistry> = Arc::new(registry);
    AppState::new(settings, registry, None).unwrap()
}

pub fn state(registry: MemoryProviderRegistry) -> AppState {
    state_with(registry, AppConfig::default())
}

pub async fn send(state: &AppState, request: Request<Body>) -> Response<Body> {
    cli_relay::api::router(state.clone())
        .oneshot(request)
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn find_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}
