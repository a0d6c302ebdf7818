// Request shaping shared by the relay path and the probe path.
//
// Both paths must call these functions instead of re-deriving models, endpoints
// or auth headers, otherwise a healthy probe stops implying healthy traffic.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use super::Platform;
use crate::config::providers::Provider;
use crate::config::PlatformOverrides;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const PROBE_PROMPT: &str = "hi";

/// How the provider credential is attached to upstream requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `x-api-key` plus a fixed `anthropic-version`
    ApiKey,
    /// `Authorization: Bearer <key>`
    Bearer,
    /// Raw key under the named header; empty or `custom` means `Authorization`
    Custom(String),
}

impl AuthStyle {
    pub fn as_str(&self) -> &str {
        match self {
            AuthStyle::ApiKey => "x-api-key",
            AuthStyle::Bearer => "bearer",
            AuthStyle::Custom(name) => name,
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "x-api-key" | "api-key" | "apikey" | "anthropic" => AuthStyle::ApiKey,
            "bearer" | "authorization-bearer" => AuthStyle::Bearer,
            _ => AuthStyle::Custom(raw.trim().to_string()),
        }
    }

    /// Header pairs carrying `api_key` in this style.
    pub fn headers(&self, api_key: &str) -> Vec<(String, String)> {
        match self {
            AuthStyle::ApiKey => vec![
                ("x-api-key".to_string(), api_key.to_string()),
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ],
            AuthStyle::Bearer => vec![("Authorization".to_string(), format!("Bearer {}", api_key))],
            AuthStyle::Custom(name) => {
                let name = name.trim();
                let header = if name.is_empty() || name.eq_ignore_ascii_case("custom") {
                    "Authorization"
                } else {
                    name
                };
                vec![(header.to_string(), api_key.to_string())]
            }
        }
    }
}

impl Serialize for AuthStyle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthStyle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(AuthStyle::parse(&raw))
    }
}

/// Request/response body family, derived from the endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    Anthropic,
    Codex,
    OpenAiChat,
}

impl WireShape {
    pub fn from_endpoint(endpoint: &str) -> Self {
        let path = endpoint.split('?').next().unwrap_or("").trim_end_matches('/');
        if path.ends_with("/messages") {
            WireShape::Anthropic
        } else if path.ends_with("/responses") {
            WireShape::Codex
        } else {
            WireShape::OpenAiChat
        }
    }

    /// Top-level field a successful response must carry. Responses payloads vary
    /// too much across upstreams to validate, so Codex has none.
    pub fn success_marker(&self) -> Option<&'static str> {
        match self {
            WireShape::Anthropic => Some("content"),
            WireShape::Codex => None,
            WireShape::OpenAiChat => Some("choices"),
        }
    }

    pub fn minimal_body(&self, model: &str) -> Value {
        match self {
            WireShape::Anthropic => json!({
                "model": model,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": PROBE_PROMPT}]
            }),
            WireShape::Codex => json!({
                "model": model,
                "input": [{"role": "user", "content": PROBE_PROMPT}],
                "max_output_tokens": 16,
                "stream": false
            }),
            WireShape::OpenAiChat => json!({
                "model": model,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": PROBE_PROMPT}]
            }),
        }
    }
}

/// Match `model` against a `*` wildcard pattern, returning the captured text.
fn wildcard_capture<'a>(pattern: &str, model: &'a str) -> Option<&'a str> {
    let (prefix, suffix) = pattern.split_once('*')?;
    if suffix.contains('*') {
        return None;
    }
    if model.len() < prefix.len() + suffix.len() {
        return None;
    }
    if model.starts_with(prefix) && model.ends_with(suffix) {
        Some(&model[prefix.len()..model.len() - suffix.len()])
    } else {
        None
    }
}

fn pattern_matches(pattern: &str, model: &str) -> bool {
    pattern == model || wildcard_capture(pattern, model).is_some()
}

/// Translate a client model name through the provider mapping table.
/// Exact keys win over wildcards; among wildcards the longest literal text wins.
pub fn map_model(provider: &Provider, model: &str) -> String {
    if let Some(target) = provider.model_mapping.get(model) {
        return target.clone();
    }

    let mut best: Option<(&str, &str, &str)> = None;
    for (pattern, target) in &provider.model_mapping {
        if let Some(captured) = wildcard_capture(pattern, model) {
            let better = match best {
                None => true,
                Some((current, _, _)) => {
                    pattern.len() > current.len()
                        || (pattern.len() == current.len() && pattern.as_str() < current)
                }
            };
            if better {
                best = Some((pattern.as_str(), target.as_str(), captured));
            }
        }
    }

    match best {
        Some((_, target, captured)) if target.contains('*') => target.replacen('*', captured, 1),
        Some((_, target, _)) => target.to_string(),
        None => model.to_string(),
    }
}

/// Whether the provider serves `model` at all.
pub fn supports_model(provider: &Provider, model: &str) -> bool {
    if provider.supported_models.is_empty() {
        return true;
    }
    provider
        .supported_models
        .iter()
        .chain(provider.model_mapping.keys())
        .any(|pattern| pattern_matches(pattern, model))
}

fn normalize_endpoint(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{}", trimmed))
    }
}

/// Provider override, then settings override, then platform default.
pub fn effective_endpoint(
    provider: &Provider,
    platform: &Platform,
    overrides: Option<&PlatformOverrides>,
) -> String {
    provider
        .api_endpoint
        .as_deref()
        .and_then(normalize_endpoint)
        .or_else(|| {
            overrides
                .and_then(|o| o.endpoint.as_deref())
                .and_then(normalize_endpoint)
        })
        .unwrap_or_else(|| platform.defaults().endpoint.to_string())
}

/// The provider's probe-only endpoint takes precedence over every other tier.
pub fn probe_endpoint(
    provider: &Provider,
    platform: &Platform,
    overrides: Option<&PlatformOverrides>,
) -> String {
    provider
        .test_endpoint
        .as_deref()
        .and_then(normalize_endpoint)
        .unwrap_or_else(|| effective_endpoint(provider, platform, overrides))
}

/// Nominal model a probe asks for, before mapping.
pub fn nominal_test_model(
    provider: &Provider,
    platform: &Platform,
    overrides: Option<&PlatformOverrides>,
) -> String {
    let non_empty = |s: &&str| !s.trim().is_empty();
    provider
        .test_model
        .as_deref()
        .filter(non_empty)
        .or_else(|| overrides.and_then(|o| o.test_model.as_deref()).filter(non_empty))
        .unwrap_or(platform.defaults().test_model)
        .trim()
        .to_string()
}

pub fn effective_auth(provider: &Provider, platform: &Platform) -> AuthStyle {
    provider
        .auth_type
        .clone()
        .unwrap_or_else(|| platform.default_auth_style())
}

pub fn probe_auth(provider: &Provider, platform: &Platform) -> AuthStyle {
    provider
        .test_auth_type
        .clone()
        .unwrap_or_else(|| effective_auth(provider, platform))
}

/// Where a live request goes and which model it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveTarget {
    pub endpoint: String,
    pub model: Option<String>,
    pub auth: AuthStyle,
}

/// Resolve a live chat request. `requested_model` comes from the client body.
pub fn resolve_live(
    provider: &Provider,
    platform: &Platform,
    overrides: Option<&PlatformOverrides>,
    requested_model: Option<&str>,
) -> LiveTarget {
    LiveTarget {
        endpoint: effective_endpoint(provider, platform, overrides),
        model: requested_model.map(|m| map_model(provider, m)),
        auth: effective_auth(provider, platform),
    }
}

/// Synthetic request a probe sends.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRequestSpec {
    pub model: String,
    pub endpoint: String,
    pub body: Value,
    pub success_marker: Option<&'static str>,
    pub auth: AuthStyle,
}

pub fn build_test_request(
    provider: &Provider,
    platform: &Platform,
    overrides: Option<&PlatformOverrides>,
) -> TestRequestSpec {
    let nominal = nominal_test_model(provider, platform, overrides);
    let model = map_model(provider, &nominal);
    let endpoint = probe_endpoint(provider, platform, overrides);
    let shape = WireShape::from_endpoint(&endpoint);
    TestRequestSpec {
        body: shape.minimal_body(&model),
        success_marker: shape.success_marker(),
        model,
        endpoint,
        auth: probe_auth(provider, platform),
    }
}

/// Join a provider base URL, endpoint path and optional query string.
pub fn join_url(base_url: &str, endpoint: &str, query: Option<&str>) -> String {
    let mut url = format!("{}{}", base_url.trim_end_matches('/'), endpoint);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push(if endpoint.contains('?') { '&' } else { '?' });
        url.push_str(q);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_header(headers: &[(String, String)], name: &str) -> Option<String> {
        headers
            .iter()
            .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    #[test]
    fn exact_mapping_beats_wildcard() {
        let provider = Provider::new(1, "p", "https://x", "k")
            .with_mapping("claude-*", "anthropic/claude-*")
            .with_mapping("claude-sonnet-4", "sonnet-exact");
        assert_eq!(map_model(&provider, "claude-sonnet-4"), "sonnet-exact");
        assert_eq!(
            map_model(&provider, "claude-opus-4"),
            "anthropic/claude-opus-4"
        );
        assert_eq!(map_model(&provider, "gpt-5"), "gpt-5");
    }

    #[test]
    fn most_specific_wildcard_wins() {
        let provider = Provider::new(1, "p", "https://x", "k")
            .with_mapping("*", "fallback")
            .with_mapping("claude-haiku-*", "haiku-fixed");
        assert_eq!(map_model(&provider, "claude-haiku-4-5"), "haiku-fixed");
        assert_eq!(map_model(&provider, "anything"), "fallback");
    }

    #[test]
    fn supported_models_include_mapping_keys() {
        let mut provider = Provider::new(1, "p", "https://x", "k").with_mapping("gpt-4o", "x");
        assert!(supports_model(&provider, "whatever"));
        provider.supported_models = vec!["claude-*".to_string()];
        assert!(supports_model(&provider, "claude-opus-4"));
        assert!(supports_model(&provider, "gpt-4o"));
        assert!(!supports_model(&provider, "gemini-2.5-pro"));
    }

    #[test]
    fn endpoint_precedence_is_provider_then_settings_then_default() {
        let mut provider = Provider::new(1, "p", "https://x", "k");
        let overrides = PlatformOverrides {
            endpoint: Some("v1/responses".to_string()),
            test_model: None,
        };
        assert_eq!(
            effective_endpoint(&provider, &Platform::Codex, None),
            "/responses"
        );
        assert_eq!(
            effective_endpoint(&provider, &Platform::Codex, Some(&overrides)),
            "/v1/responses"
        );
        provider.api_endpoint = Some("/backend/responses".to_string());
        assert_eq!(
            effective_endpoint(&provider, &Platform::Codex, Some(&overrides)),
            "/backend/responses"
        );
        provider.test_endpoint = Some("/probe/responses".to_string());
        assert_eq!(
            probe_endpoint(&provider, &Platform::Codex, Some(&overrides)),
            "/probe/responses"
        );
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let mut provider = Provider::new(1, "p", "https://x", "k");
        provider.api_endpoint = Some("   ".to_string());
        provider.test_model = Some(String::new());
        assert_eq!(
            effective_endpoint(&provider, &Platform::Claude, None),
            "/v1/messages"
        );
        assert_eq!(
            nominal_test_model(&provider, &Platform::Claude, None),
            Platform::Claude.defaults().test_model
        );
    }

    #[test]
    fn auth_header_styles() {
        let headers = AuthStyle::ApiKey.headers("sk-1");
        assert_eq!(find_header(&headers, "x-api-key").as_deref(), Some("sk-1"));
        assert_eq!(
            find_header(&headers, "anthropic-version").as_deref(),
            Some(ANTHROPIC_VERSION)
        );

        let headers = AuthStyle::Bearer.headers("sk-2");
        assert_eq!(
            find_header(&headers, "Authorization").as_deref(),
            Some("Bearer sk-2")
        );

        let headers = AuthStyle::Custom("X-Relay-Key".to_string()).headers("sk-3");
        assert_eq!(find_header(&headers, "X-Relay-Key").as_deref(), Some("sk-3"));

        for name in ["", "custom", "CUSTOM"] {
            let headers = AuthStyle::Custom(name.to_string()).headers("sk-4");
            assert_eq!(find_header(&headers, "Authorization").as_deref(), Some("sk-4"));
        }
    }

    #[test]
    fn test_request_shapes_follow_endpoint() {
        let provider = Provider::new(1, "p", "https://x", "k");

        let spec = build_test_request(&provider, &Platform::Claude, None);
        assert_eq!(spec.endpoint, "/v1/messages");
        assert_eq!(spec.success_marker, Some("content"));
        assert_eq!(spec.body["max_tokens"], 1);
        assert!(spec.body["messages"].is_array());
        assert_eq!(spec.auth, AuthStyle::ApiKey);

        let spec = build_test_request(&provider, &Platform::Codex, None);
        assert_eq!(spec.endpoint, "/responses");
        assert_eq!(spec.success_marker, None);
        assert!(spec.body["input"].is_array());
        assert!(spec.body.get("max_output_tokens").is_some());
        assert_eq!(spec.auth, AuthStyle::Bearer);

        let spec = build_test_request(&provider, &Platform::Gemini, None);
        assert_eq!(spec.success_marker, Some("choices"));
        assert!(spec.body["messages"].is_array());
    }

    #[test]
    fn probe_and_live_resolution_agree() {
        let mut provider = Provider::new(1, "p", "https://x", "k")
            .with_mapping("gpt-4o-mini", "openai/gpt-4o-mini");
        provider.test_model = Some("gpt-4o-mini".to_string());
        provider.api_endpoint = Some("/api/v1/chat/completions".to_string());
        let platform = Platform::Custom("droid".to_string());

        let probe = build_test_request(&provider, &platform, None);
        let live = resolve_live(&provider, &platform, None, Some("gpt-4o-mini"));

        assert_eq!(probe.model, "openai/gpt-4o-mini");
        assert_eq!(live.model.as_deref(), Some(probe.model.as_str()));
        assert_eq!(live.endpoint, probe.endpoint);
        assert_eq!(live.auth, probe.auth);
        assert_eq!(probe.body["model"], "openai/gpt-4o-mini");
    }

    #[test]
    fn join_url_appends_query() {
        assert_eq!(
            join_url("https://x/", "/v1/models", Some("limit=5")),
            "https://x/v1/models?limit=5"
        );
        assert_eq!(join_url("https://x", "/v1/models", None), "https://x/v1/models");
    }
}
