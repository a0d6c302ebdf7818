// Relay handlers - pick a provider, rewrite, forward, account, fail over

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use super::AppState;
use crate::error::RelayError;
use crate::probe::classify::{classify_status, classify_transport_error, truncate_message, ProbeStatus};
use crate::probe::ProbeResult;
use crate::proxy::resolver::{join_url, resolve_live};
use crate::proxy::Platform;

/// Which upstream path a relay route targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointMode {
    /// Resolved per provider by the shared resolver
    Chat,
    /// Fixed path relative to the provider base URL
    Passthrough(String),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::NoProviderAvailable { .. } => StatusCode::NOT_FOUND,
            RelayError::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
            RelayError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            RelayError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub async fn claude_messages(State(state): State<AppState>, request: Request<Body>) -> Response {
    forward(&state, Platform::Claude, EndpointMode::Chat, request).await
}

pub async fn claude_count_tokens(State(state): State<AppState>, request: Request<Body>) -> Response {
    let mode = EndpointMode::Passthrough("/v1/messages/count_tokens".to_string());
    forward(&state, Platform::Claude, mode, request).await
}

pub async fn claude_models(State(state): State<AppState>, request: Request<Body>) -> Response {
    forward_models(&state, Platform::Claude, request).await
}

pub async fn codex_responses(State(state): State<AppState>, request: Request<Body>) -> Response {
    forward(&state, Platform::Codex, EndpointMode::Chat, request).await
}

pub async fn codex_models(State(state): State<AppState>, request: Request<Body>) -> Response {
    forward_models(&state, Platform::Codex, request).await
}

pub async fn gemini_chat(State(state): State<AppState>, request: Request<Body>) -> Response {
    forward(&state, Platform::Gemini, EndpointMode::Chat, request).await
}

pub async fn gemini_models(State(state): State<AppState>, request: Request<Body>) -> Response {
    forward_models(&state, Platform::Gemini, request).await
}

fn custom_platform(tool: &str) -> Result<Platform, Response> {
    format!("custom:{}", tool).parse::<Platform>().map_err(|e| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {"message": e.to_string(), "type": "invalid_request_error", "code": 404}
            })),
        )
            .into_response()
    })
}

/// Token counting keeps its own path; every other POST under a custom tool
/// goes to the resolved chat endpoint.
fn custom_post_mode(rest: &str) -> EndpointMode {
    let rest = rest.trim_matches('/');
    if rest.ends_with("count_tokens") {
        EndpointMode::Passthrough(format!("/{}", rest))
    } else {
        EndpointMode::Chat
    }
}

pub async fn custom_post(
    State(state): State<AppState>,
    Path((tool, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response {
    match custom_platform(&tool) {
        Ok(platform) => forward(&state, platform, custom_post_mode(&rest), request).await,
        Err(response) => response,
    }
}

/// GETs (model listings and the like) keep their path below the tool prefix.
pub async fn custom_get(
    State(state): State<AppState>,
    Path((tool, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response {
    match custom_platform(&tool) {
        Ok(platform) => {
            let path = format!("/{}", rest.trim_start_matches('/'));
            forward(&state, platform, EndpointMode::Passthrough(path), request).await
        }
        Err(response) => response,
    }
}

async fn forward_models(state: &AppState, platform: Platform, request: Request<Body>) -> Response {
    let mode = EndpointMode::Passthrough(platform.defaults().models_path.to_string());
    forward(state, platform, mode, request).await
}

/// Relay one client request, tagged with its own request id.
pub async fn forward(state: &AppState, platform: Platform, mode: EndpointMode, request: Request<Body>) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("relay", %request_id, %platform);
    match relay(state, &platform, &mode, request).instrument(span).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("[{}] relay failed: {}", platform, e);
            e.into_response()
        }
    }
}

fn is_hop_by_hop_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
}

fn should_skip_request_header(name: &HeaderName) -> bool {
    let lower = name.as_str();
    is_hop_by_hop_header(lower)
        || lower.eq_ignore_ascii_case("host")
        || lower.eq_ignore_ascii_case("content-length")
        || lower.eq_ignore_ascii_case("authorization")
        || lower.eq_ignore_ascii_case("x-api-key")
}

fn should_skip_response_header(name: &HeaderName) -> bool {
    let lower = name.as_str();
    is_hop_by_hop_header(lower) || lower.eq_ignore_ascii_case("content-length")
}

/// Client headers minus hop-by-hop and inbound credentials, with the provider's
/// auth headers put in place (replacing any client copy).
pub fn outbound_headers(inbound: &HeaderMap, auth: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if should_skip_request_header(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    for (name, value) in auth {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!("Skipping invalid auth header {}", name),
        }
    }
    headers
}

/// Substitute the upstream model; the rest of the body is left untouched.
pub fn rewrite_model(body: &Value, model: &str) -> Option<Bytes> {
    let mut body = body.clone();
    body.as_object_mut()?
        .insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&body).ok().map(Bytes::from)
}

fn upstream_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if should_skip_response_header(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    match builder.body(body) {
        Ok(response) => response,
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("build response failed: {err}"),
        )
            .into_response(),
    }
}

struct UpstreamFailure {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

async fn relay(
    state: &AppState,
    platform: &Platform,
    mode: &EndpointMode,
    request: Request<Body>,
) -> Result<Response, RelayError> {
    let config = state.settings.get();
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, config.relay.max_body_bytes)
        .await
        .map_err(|_| RelayError::BodyTooLarge)?;

    let parsed: Option<Value> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(e) if *mode == EndpointMode::Chat => return Err(RelayError::InvalidBody(e.to_string())),
            Err(_) => None,
        }
    };
    let requested_model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(|m| m.as_str())
        .map(str::to_string);

    let candidates = state.router.candidates(platform, requested_model.as_deref())?;
    if candidates.is_empty() {
        return Err(RelayError::NoProviderAvailable {
            platform: platform.clone(),
        });
    }

    let overrides = config.platform_overrides(platform);
    let slow_ms = config.probe.slow_threshold_ms;
    let timeout = (config.relay.timeout_secs > 0).then(|| Duration::from_secs(config.relay.timeout_secs));
    let client = state.transport.client();

    let mut last_upstream: Option<UpstreamFailure> = None;
    let mut last_transport = String::new();

    for (attempt, provider) in candidates.iter().enumerate() {
        let target = resolve_live(provider, platform, overrides, requested_model.as_deref());
        let path = match mode {
            EndpointMode::Chat => target.endpoint.as_str(),
            EndpointMode::Passthrough(path) => path.as_str(),
        };
        let url = join_url(provider.base_url(), path, parts.uri.query());
        let model_label = target.model.as_deref().unwrap_or_default();

        let payload = match (&parsed, &target.model) {
            (Some(value), Some(model)) if Some(model) != requested_model.as_ref() => {
                rewrite_model(value, model).unwrap_or_else(|| body.clone())
            }
            _ => body.clone(),
        };

        let headers = outbound_headers(&parts.headers, &target.auth.headers(&provider.api_key));
        let mut builder = client.request(parts.method.clone(), &url).headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if !payload.is_empty() {
            builder = builder.body(payload);
        }

        tracing::debug!(
            "[{}] attempt {} via {} -> {} (model {:?})",
            platform,
            attempt + 1,
            provider.name,
            url,
            target.model
        );

        let started = Instant::now();
        match builder.send().await {
            Ok(upstream) => {
                let status = upstream.status();
                let latency_ms = started.elapsed().as_millis() as u64;
                let (outcome, sub_status) = classify_status(status.as_u16(), latency_ms, slow_ms);
                let mut result = ProbeResult::for_request(provider, platform, model_label, path);
                result.status = outcome;
                result.sub_status = sub_status;
                result.latency_ms = latency_ms;
                result.http_code = Some(status.as_u16());

                if outcome != ProbeStatus::Unavailable {
                    state.probes.record(&result);
                    tracing::info!(
                        "[{}] {} {} via {} ({}ms)",
                        platform,
                        parts.method,
                        status.as_u16(),
                        provider.name,
                        latency_ms
                    );
                    let headers = upstream.headers().clone();
                    return Ok(upstream_response(
                        status,
                        &headers,
                        Body::from_stream(upstream.bytes_stream()),
                    ));
                }

                tracing::warn!(
                    "[{}] provider {} returned {} ({}), trying next",
                    platform,
                    provider.name,
                    status.as_u16(),
                    sub_status
                );
                let headers = upstream.headers().clone();
                let body = match upstream.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(
                            "[{}] failed to read error body from {}: {}",
                            platform,
                            provider.name,
                            e
                        );
                        Bytes::new()
                    }
                };
                result.message = truncate_message(&String::from_utf8_lossy(&body));
                state.probes.record(&result);
                last_upstream = Some(UpstreamFailure {
                    status,
                    headers,
                    body,
                });
            }
            Err(e) => {
                let (outcome, sub_status) = classify_transport_error(&e);
                let mut result = ProbeResult::for_request(provider, platform, model_label, path);
                result.status = outcome;
                result.sub_status = sub_status;
                result.latency_ms = started.elapsed().as_millis() as u64;
                result.message = truncate_message(&e.to_string());
                state.probes.record(&result);
                tracing::warn!(
                    "[{}] provider {} failed ({}): {}, trying next",
                    platform,
                    provider.name,
                    sub_status,
                    e
                );
                last_transport = e.to_string();
            }
        }
    }

    match last_upstream {
        Some(failure) => Ok(upstream_response(
            failure.status,
            &failure.headers,
            Body::from(failure.body),
        )),
        None => Err(RelayError::AllProvidersFailed {
            platform: platform.clone(),
            last_error: last_transport,
        }),
    }
}
