// Outcome classification shared by probes and live relay traffic

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MAX_MESSAGE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Available,
    /// Slow or timed out; neutral for failure accounting.
    Degraded,
    Unavailable,
    /// No data yet
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatus {
    None,
    SlowLatency,
    RateLimit,
    ServerError,
    ClientError,
    AuthError,
    InvalidRequest,
    NetworkError,
    ContentMismatch,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Available => "available",
            ProbeStatus::Degraded => "degraded",
            ProbeStatus::Unavailable => "unavailable",
            ProbeStatus::Missing => "missing",
        }
    }
}

impl SubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStatus::None => "none",
            SubStatus::SlowLatency => "slow_latency",
            SubStatus::RateLimit => "rate_limit",
            SubStatus::ServerError => "server_error",
            SubStatus::ClientError => "client_error",
            SubStatus::AuthError => "auth_error",
            SubStatus::InvalidRequest => "invalid_request",
            SubStatus::NetworkError => "network_error",
            SubStatus::ContentMismatch => "content_mismatch",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(ProbeStatus::Available),
            "degraded" => Ok(ProbeStatus::Degraded),
            "unavailable" => Ok(ProbeStatus::Unavailable),
            "missing" => Ok(ProbeStatus::Missing),
            other => Err(format!("unknown probe status: {}", other)),
        }
    }
}

impl FromStr for SubStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubStatus::None),
            "slow_latency" => Ok(SubStatus::SlowLatency),
            "rate_limit" => Ok(SubStatus::RateLimit),
            "server_error" => Ok(SubStatus::ServerError),
            "client_error" => Ok(SubStatus::ClientError),
            "auth_error" => Ok(SubStatus::AuthError),
            "invalid_request" => Ok(SubStatus::InvalidRequest),
            "network_error" => Ok(SubStatus::NetworkError),
            "content_mismatch" => Ok(SubStatus::ContentMismatch),
            other => Err(format!("unknown sub status: {}", other)),
        }
    }
}

/// HTTP-layer classification, evaluated before any content check.
pub fn classify_status(code: u16, latency_ms: u64, slow_threshold_ms: u64) -> (ProbeStatus, SubStatus) {
    match code {
        200..=399 if latency_ms > slow_threshold_ms => (ProbeStatus::Degraded, SubStatus::SlowLatency),
        200..=399 => (ProbeStatus::Available, SubStatus::None),
        400 => (ProbeStatus::Unavailable, SubStatus::InvalidRequest),
        401 | 403 => (ProbeStatus::Unavailable, SubStatus::AuthError),
        429 => (ProbeStatus::Unavailable, SubStatus::RateLimit),
        500..=599 => (ProbeStatus::Unavailable, SubStatus::ServerError),
        _ => (ProbeStatus::Unavailable, SubStatus::ClientError),
    }
}

/// Second pass: a response without the expected marker field is not healthy.
pub fn classify_content(
    current: (ProbeStatus, SubStatus),
    body: &[u8],
    marker: Option<&str>,
) -> (ProbeStatus, SubStatus) {
    let Some(marker) = marker else {
        return current;
    };
    if current.0 == ProbeStatus::Unavailable {
        return current;
    }
    if body_has_marker(body, marker) {
        current
    } else {
        (ProbeStatus::Unavailable, SubStatus::ContentMismatch)
    }
}

/// Top-level JSON field check, with a raw substring fallback for SSE/non-JSON bodies.
pub fn body_has_marker(body: &[u8], marker: &str) -> bool {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => map.contains_key(marker),
        Ok(_) => false,
        Err(_) => {
            let needle = format!("\"{}\"", marker);
            String::from_utf8_lossy(body).contains(&needle)
        }
    }
}

pub fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("deadline exceeded")
        || lower.contains("context canceled")
}

/// The top-level reqwest message embeds the request URL, so only its
/// sources are searched for timeout text.
pub fn is_timeout_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if is_timeout_message(&e.to_string()) {
            return true;
        }
        source = e.source();
    }
    false
}

/// Timeouts are Degraded so a slow provider is never blacklisted; everything
/// else that fails below HTTP (DNS, refused, TLS) is a network error.
pub fn classify_transport_failure(timed_out: bool) -> (ProbeStatus, SubStatus) {
    if timed_out {
        (ProbeStatus::Degraded, SubStatus::SlowLatency)
    } else {
        (ProbeStatus::Unavailable, SubStatus::NetworkError)
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> (ProbeStatus, SubStatus) {
    classify_transport_failure(is_timeout_error(err))
}

/// Char-boundary safe truncation to `MAX_MESSAGE_CHARS`.
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
