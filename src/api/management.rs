// Management API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::streaming;
use super::AppState;
use crate::config::AppConfig;
use crate::error::ProbeError;
use crate::probe::ProbeOptions;
use crate::proxy::Platform;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_platform(raw: &str) -> Result<Platform, Response> {
    raw.parse::<Platform>()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

/// Keep the last four characters so keys can still be told apart.
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}

// Root endpoint
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "CLI Relay Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "POST /v1/messages",
            "POST /v1/messages/count_tokens",
            "GET /v1/models",
            "POST /responses",
            "POST /v1/responses",
            "GET /codex/v1/models",
            "POST /gemini/v1/chat/completions",
            "GET /gemini/v1/models",
            "POST /custom/:tool/*path",
            "GET /custom/:tool/*path"
        ]
    }))
}

/// Get server status
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.settings.get();
    Json(json!({
        "running": true,
        "address": config.listen_addr(),
        "autoProbe": state.probes.auto_probe_running(),
        "proxy": state.transport.current_config(),
        "blacklist": config.blacklist,
        "blacklisted": state
            .availability
            .snapshot()
            .iter()
            .filter(|e| state.availability.is_blacklisted(&e.platform, &e.provider))
            .count(),
    }))
}

/// Get current configuration
pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.settings.get())
}

/// Replace the configuration and re-apply proxy and scheduler settings.
/// A bad proxy setting rejects the whole update, and a failed save restores
/// the previous proxy.
pub async fn update_config(State(state): State<AppState>, Json(config): Json<AppConfig>) -> Response {
    if let Err(e) = state.transport.configure(&config.proxy) {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let previous = state.settings.get();
    if let Err(e) = state.settings.update(config.clone()) {
        if let Err(revert) = state.transport.configure(&previous.proxy) {
            tracing::error!("Failed to restore previous proxy settings: {}", revert);
        }
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to save config: {}", e),
        );
    }

    state.probes.set_options(ProbeOptions::from_config(&config.probe));
    if config.probe.auto_enabled {
        if previous.probe.interval_secs != config.probe.interval_secs {
            state.probes.set_auto_probe(false).await;
        }
        state.probes.set_auto_probe(true).await;
    } else {
        state.probes.set_auto_probe(false).await;
    }

    if previous.port != config.port || previous.host != config.host {
        tracing::info!("Listen address changed, takes effect on restart");
    }

    Json(json!({ "status": "ok" })).into_response()
}

/// Providers of a platform with their blacklist state and latest probe.
pub async fn list_providers(State(state): State<AppState>, Path(platform): Path<String>) -> Response {
    let platform = match parse_platform(&platform) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let providers = match state.registry.load_providers(&platform) {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let items: Vec<Value> = providers
        .iter()
        .map(|provider| {
            let mut item = serde_json::to_value(provider).unwrap_or_else(|_| json!({}));
            item["apiKey"] = json!(mask_key(&provider.api_key));
            item["blacklisted"] = json!(state.availability.is_blacklisted(&platform, &provider.name));
            item["availability"] = json!(state.availability.entry(&platform, &provider.name));
            item["probe"] = json!(state.probes.get_result(&platform, provider.id));
            item
        })
        .collect();

    Json(json!({ "platform": platform, "providers": items })).into_response()
}

pub async fn all_probe_results(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.probes.get_all_results())
}

pub async fn platform_probe_results(State(state): State<AppState>, Path(platform): Path<String>) -> Response {
    match parse_platform(&platform) {
        Ok(platform) => Json(state.probes.get_results(&platform)).into_response(),
        Err(response) => response,
    }
}

pub async fn run_platform_probe(State(state): State<AppState>, Path(platform): Path<String>) -> Response {
    match parse_platform(&platform) {
        Ok(platform) => Json(state.probes.probe_all(&platform).await).into_response(),
        Err(response) => response,
    }
}

pub async fn run_single_probe(
    State(state): State<AppState>,
    Path((platform, id)): Path<(String, i64)>,
) -> Response {
    let platform = match parse_platform(&platform) {
        Ok(p) => p,
        Err(response) => return response,
    };
    match state.probes.probe_single(&platform, id).await {
        Ok(result) => Json(result).into_response(),
        Err(e @ ProbeError::ProviderNotFound { .. }) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn list_blacklist(State(state): State<AppState>) -> impl IntoResponse {
    let entries: Vec<Value> = state
        .availability
        .snapshot()
        .into_iter()
        .map(|entry| {
            let blacklisted = state.availability.is_blacklisted(&entry.platform, &entry.provider);
            let mut item = json!(entry);
            item["blacklisted"] = json!(blacklisted);
            item
        })
        .collect();
    Json(entries)
}

pub async fn clear_blacklist(
    State(state): State<AppState>,
    Path((platform, name)): Path<(String, String)>,
) -> Response {
    let platform = match parse_platform(&platform) {
        Ok(p) => p,
        Err(response) => return response,
    };
    if state.availability.clear(&platform, &name) {
        Json(json!({ "status": "ok" })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("no availability entry for {}", name))
    }
}

pub async fn events(State(state): State<AppState>) -> impl IntoResponse {
    streaming::availability_events(state.events.subscribe())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_masked() {
        assert_eq!(mask_key("sk-1234567890"), "*********7890");
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key(""), "");
    }
}
