// HTTP API Server module

use anyhow::Result;
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod management;
pub mod relay;
pub mod streaming;

use crate::availability::notify::BroadcastNotifier;
use crate::availability::AvailabilityTracker;
use crate::config::providers::ProviderRegistry;
use crate::config::ConfigStore;
use crate::db::StateStore;
use crate::error::TransportError;
use crate::probe::ProbeEngine;
use crate::proxy::router::ProviderRouter;
use crate::proxy::transport::TransportManager;

/// Service handles shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<ConfigStore>,
    pub registry: Arc<dyn ProviderRegistry>,
    pub transport: Arc<TransportManager>,
    pub availability: Arc<AvailabilityTracker>,
    pub probes: Arc<ProbeEngine>,
    pub router: Arc<ProviderRouter>,
    pub events: Arc<BroadcastNotifier>,
}

impl AppState {
    /// Wire the core services together. `store` is shared by availability and probes.
    pub fn new(
        settings: Arc<ConfigStore>,
        registry: Arc<dyn ProviderRegistry>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Self, TransportError> {
        let config = settings.get();
        let transport = Arc::new(TransportManager::new(&config.proxy)?);
        let events = Arc::new(BroadcastNotifier::default());

        let mut availability =
            AvailabilityTracker::new(settings.clone()).with_notifier(events.clone());
        if let Some(store) = &store {
            availability = availability.with_store(store.clone());
        }
        let availability = Arc::new(availability);

        let mut probes = ProbeEngine::new(
            registry.clone(),
            transport.clone(),
            availability.clone(),
            settings.clone(),
        );
        if let Some(store) = store {
            probes = probes.with_store(store);
        }

        Ok(Self {
            router: Arc::new(ProviderRouter::new(registry.clone(), availability.clone())),
            probes: Arc::new(probes),
            settings,
            registry,
            transport,
            availability,
            events,
        })
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("Content-Type", "application/json")],
        r#"{"error":{"message":"Invalid API key","type":"invalid_request_error","code":"invalid_api_key"}}"#,
    )
        .into_response()
}

/// API Key authentication middleware
async fn auth_middleware(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let api_keys = state.settings.get().api_keys;

    // If no API keys configured, allow all requests
    if api_keys.is_empty() {
        return next.run(request).await;
    }

    let headers = request.headers();
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));

    match presented {
        Some(key) if api_keys.iter().any(|k| k == key.trim()) => next.run(request).await,
        _ => unauthorized(),
    }
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    // Routes that require API key authentication
    let relay_routes = Router::new()
        .route("/v1/messages", post(relay::claude_messages))
        .route("/v1/messages/count_tokens", post(relay::claude_count_tokens))
        .route("/v1/models", get(relay::claude_models))
        .route("/responses", post(relay::codex_responses))
        .route("/v1/responses", post(relay::codex_responses))
        .route("/codex/v1/models", get(relay::codex_models))
        .route("/gemini/v1/chat/completions", post(relay::gemini_chat))
        .route("/gemini/v1/models", get(relay::gemini_models))
        .route("/custom/:tool/*rest", post(relay::custom_post).get(relay::custom_get))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Management API (local use)
    let management_routes = Router::new()
        .route("/", get(management::root))
        .route("/management/status", get(management::get_status))
        .route(
            "/management/config",
            get(management::get_config).put(management::update_config),
        )
        .route("/management/providers/:platform", get(management::list_providers))
        .route("/management/probes", get(management::all_probe_results))
        .route(
            "/management/probes/:platform",
            get(management::platform_probe_results).post(management::run_platform_probe),
        )
        .route("/management/probes/:platform/:id", post(management::run_single_probe))
        .route("/management/blacklist", get(management::list_blacklist))
        .route(
            "/management/blacklist/:platform/:name",
            delete(management::clear_blacklist),
        )
        .route("/management/events", get(management::events));

    Router::new()
        .merge(relay_routes)
        .merge(management_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running server; dropping it without `stop` leaves the server running.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Graceful shutdown; waits for in-flight connections to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.join.await??;
        tracing::info!("API server stopped");
        Ok(())
    }
}

pub async fn start_server(state: AppState) -> Result<ServerHandle> {
    let addr = state.settings.get().listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("API server listening on {}", local_addr);

    let app = router(state);
    let (tx, rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
    });

    Ok(ServerHandle {
        addr: local_addr,
        shutdown: tx,
        join,
    })
}
