mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cli_relay::config::providers::{MemoryProviderRegistry, Provider};
use cli_relay::config::AppConfig;
use cli_relay::db::SqliteStore;
use cli_relay::probe::classify::{ProbeStatus, SubStatus};
use cli_relay::probe::{ProbeEngine, ProbeOptions};
use cli_relay::proxy::Platform;
use common::{closed_port_url, find_header, spawn_upstream, state, Recorder};

fn fast_options(timeout: Duration) -> ProbeOptions {
    ProbeOptions {
        timeout,
        slow_threshold_ms: 5000,
        concurrency: 5,
        interval: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn mapped_test_model_reaches_upstream_and_succeeds() {
    let recorder = Recorder::default();
    let seen = recorder.clone();
    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        post(move |request: Request<Body>| {
            let seen = seen.clone();
            async move {
                seen.record(request).await;
                Json(json!({"id": "c1", "choices": [{"message": {"content": "hi"}}]}))
            }
        }),
    ))
    .await;

    let mut provider = Provider::new(1, "relay-a", upstream, "sk-test")
        .with_mapping("gpt-4o-mini", "openai/gpt-4o-mini");
    provider.test_model = Some("gpt-4o-mini".to_string());
    let registry = MemoryProviderRegistry::new().with_providers(Platform::Gemini, vec![provider]);
    let state = state(registry);

    let result = state.probes.probe_single(&Platform::Gemini, 1).await.unwrap();
    assert_eq!(result.status, ProbeStatus::Available);
    assert_eq!(result.sub_status, SubStatus::None);
    assert_eq!(result.http_code, Some(200));
    assert_eq!(result.model, "openai/gpt-4o-mini");
    assert_eq!(result.endpoint, "/v1/chat/completions");

    let captured = recorder.last().unwrap();
    assert_eq!(captured.body["model"], "openai/gpt-4o-mini");
    assert_eq!(captured.body["max_tokens"], 1);
    assert_eq!(
        find_header(&captured.headers, "authorization").as_deref(),
        Some("Bearer sk-test")
    );

    assert_eq!(state.probes.get_results(&Platform::Gemini), vec![result]);
    let entry = state.availability.entry(&Platform::Gemini, "relay-a").unwrap();
    assert_eq!(entry.last_status, ProbeStatus::Available);
}

#[tokio::test]
async fn repeated_rate_limits_blacklist_the_provider() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async { (StatusCode::TOO_MANY_REQUESTS, Json(json!({"error": "slow down"}))) }),
    ))
    .await;

    let registry = MemoryProviderRegistry::new()
        .with_providers(Platform::Claude, vec![Provider::new(1, "flaky", upstream, "k")]);
    let state = state(registry);

    for attempt in 1..=3 {
        let result = state.probes.probe_single(&Platform::Claude, 1).await.unwrap();
        assert_eq!(result.status, ProbeStatus::Unavailable);
        assert_eq!(result.sub_status, SubStatus::RateLimit);
        assert_eq!(result.message, r#"{"error":"slow down"}"#);
        assert_eq!(
            state.availability.is_blacklisted(&Platform::Claude, "flaky"),
            attempt == 3
        );
    }
}

#[tokio::test]
async fn timeout_is_degraded_and_leaves_failures_alone() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Json(json!({"content": []}))
        }),
    ))
    .await;

    let registry = MemoryProviderRegistry::new()
        .with_providers(Platform::Claude, vec![Provider::new(1, "slow", upstream, "k")]);
    let state = state(registry);
    state.probes.set_options(fast_options(Duration::from_millis(100)));

    state.availability.record_failure(&Platform::Claude, "slow");
    let result = state.probes.probe_single(&Platform::Claude, 1).await.unwrap();

    assert_eq!(result.status, ProbeStatus::Degraded);
    assert_eq!(result.sub_status, SubStatus::SlowLatency);
    assert_eq!(result.http_code, None);
    assert_eq!(state.availability.consecutive_failures(&Platform::Claude, "slow"), 1);
    assert!(!state.availability.is_blacklisted(&Platform::Claude, "slow"));
}

#[tokio::test]
async fn probe_all_never_exceeds_five_in_flight() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current, max) = (in_flight.clone(), peak.clone());
    let upstream = spawn_upstream(Router::new().route(
        "/responses",
        post(move || {
            let (current, max) = (current.clone(), max.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Json(json!({"id": "resp_1", "output": []}))
            }
        }),
    ))
    .await;

    let providers: Vec<Provider> = (1..=12)
        .map(|id| Provider::new(id, format!("p{}", id), upstream.clone(), "k"))
        .collect();
    let registry = MemoryProviderRegistry::new().with_providers(Platform::Codex, providers);
    let state = state(registry);
    state.probes.set_options(fast_options(Duration::from_secs(10)));

    let results = state.probes.probe_all(&Platform::Codex).await;

    assert_eq!(results.len(), 12);
    assert!(results.iter().all(|r| r.status == ProbeStatus::Available));
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak in-flight was {}", peak);
    assert!(peak >= 2, "probes did not overlap");
}

#[tokio::test]
async fn missing_marker_and_refused_connection_are_unavailable() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        post(|| async { Json(json!({"error": {"message": "upstream said no"}})) }),
    ))
    .await;
    let dead = closed_port_url().await;

    let registry = MemoryProviderRegistry::new().with_providers(
        Platform::Custom("droid".into()),
        vec![
            Provider::new(1, "wrong-shape", upstream, "k"),
            Provider::new(2, "dead", dead, "k"),
        ],
    );
    let state = state(registry);
    let platform = Platform::Custom("droid".into());

    let results = state.probes.probe_all(&platform).await;
    assert_eq!(results[0].status, ProbeStatus::Unavailable);
    assert_eq!(results[0].sub_status, SubStatus::ContentMismatch);
    assert_eq!(results[1].status, ProbeStatus::Unavailable);
    assert_eq!(results[1].sub_status, SubStatus::NetworkError);
    assert!(!results[1].message.is_empty());

    assert_eq!(state.availability.consecutive_failures(&platform, "wrong-shape"), 1);
    assert_eq!(state.availability.consecutive_failures(&platform, "dead"), 1);
}

#[tokio::test]
async fn auto_probe_runs_on_enable_and_stops() {
    let recorder = Recorder::default();
    let seen = recorder.clone();
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(move |request: Request<Body>| {
            let seen = seen.clone();
            async move {
                seen.record(request).await;
                Json(json!({"content": [{"type": "text", "text": "hi"}]}))
            }
        }),
    ))
    .await;

    let registry = MemoryProviderRegistry::new()
        .with_providers(Platform::Claude, vec![Provider::new(1, "a", upstream, "sk-ant")]);
    let state = state(registry);

    assert!(state.probes.set_auto_probe(true).await);
    assert!(state.probes.auto_probe_running());

    for _ in 0..50 {
        if !state.probes.get_results(&Platform::Claude).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(recorder.hits(), 1);
    let captured = recorder.last().unwrap();
    assert_eq!(find_header(&captured.headers, "x-api-key").as_deref(), Some("sk-ant"));
    assert_eq!(
        find_header(&captured.headers, "anthropic-version").as_deref(),
        Some("2023-06-01")
    );
    assert_eq!(captured.body["model"], "claude-haiku-4-5-20251001");

    assert!(state.probes.set_auto_probe(false).await);
    assert!(!state.probes.auto_probe_running());
    assert!(!state.probes.set_auto_probe(false).await);
}

#[tokio::test]
async fn results_survive_restart_through_sqlite() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async { Json(json!({"content": []})) }),
    ))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("relay.db");

    let registry = Arc::new(
        MemoryProviderRegistry::new()
            .with_providers(Platform::Claude, vec![Provider::new(4, "a", upstream, "k")]),
    );
    let first = common::state(MemoryProviderRegistry::new());
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let engine = Arc::new(
        ProbeEngine::new(
            registry.clone(),
            first.transport.clone(),
            first.availability.clone(),
            first.settings.clone(),
        )
        .with_store(store),
    );
    let result = engine.probe_single(&Platform::Claude, 4).await.unwrap();
    drop(engine);

    let reopened = Arc::new(SqliteStore::open(&db_path).unwrap());
    let second = common::state_with(MemoryProviderRegistry::new(), AppConfig::default());
    let engine = ProbeEngine::new(
        registry,
        second.transport.clone(),
        second.availability.clone(),
        second.settings.clone(),
    )
    .with_store(reopened);
    engine.restore();

    let restored = engine.get_results(&Platform::Claude);
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].provider_id, result.provider_id);
    assert_eq!(restored[0].status, ProbeStatus::Available);
    assert_eq!(
        restored[0].checked_at.timestamp_millis(),
        result.checked_at.timestamp_millis()
    );
}

#[tokio::test]
async fn oversized_concurrency_is_still_capped_at_five() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current, max) = (in_flight.clone(), peak.clone());
    let upstream = spawn_upstream(Router::new().route(
        "/responses",
        post(move || {
            let (current, max) = (current.clone(), max.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Json(json!({"id": "resp_1", "output": []}))
            }
        }),
    ))
    .await;

    let providers: Vec<Provider> = (1..=12)
        .map(|id| Provider::new(id, format!("p{}", id), upstream.clone(), "k"))
        .collect();
    let state = state(MemoryProviderRegistry::new().with_providers(Platform::Codex, providers));
    state.probes.set_options(ProbeOptions {
        concurrency: 12,
        ..fast_options(Duration::from_secs(10))
    });

    let results = state.probes.probe_all(&Platform::Codex).await;

    assert_eq!(results.len(), 12);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak in-flight was {}", peak);
}

#[tokio::test]
async fn timeout_in_url_does_not_hide_refused_connections() {
    let dead = format!("{}/no-timeout-gw", closed_port_url().await);
    let state = state(
        MemoryProviderRegistry::new()
            .with_providers(Platform::Claude, vec![Provider::new(1, "gw", dead, "k")]),
    );

    for _ in 0..3 {
        let result = state.probes.probe_single(&Platform::Claude, 1).await.unwrap();
        assert_eq!(result.status, ProbeStatus::Unavailable);
        assert_eq!(result.sub_status, SubStatus::NetworkError);
    }
    assert_eq!(state.availability.consecutive_failures(&Platform::Claude, "gw"), 3);
    assert!(state.availability.is_blacklisted(&Platform::Claude, "gw"));
}
