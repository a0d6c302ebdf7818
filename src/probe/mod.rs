// Probe engine - synthetic health checks feeding the availability tracker

pub mod classify;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::availability::AvailabilityTracker;
use crate::config::providers::{Provider, ProviderRegistry};
use crate::config::{ConfigStore, ProbeConfig};
use crate::db::StateStore;
use crate::error::ProbeError;
use crate::proxy::resolver::{build_test_request, join_url};
use crate::proxy::transport::TransportManager;
use crate::proxy::Platform;
use crate::scheduler::PeriodicTask;
use classify::{
    classify_content, classify_status, classify_transport_error, classify_transport_failure,
    truncate_message, ProbeStatus, SubStatus,
};

/// Hard cap on simultaneous in-flight probes.
pub const MAX_CONCURRENT_PROBES: usize = 5;
pub const MIN_PROBE_TIMEOUT_SECS: u64 = 10;
pub const MAX_PROBE_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub slow_threshold_ms: u64,
    pub concurrency: usize,
    pub interval: Duration,
}

impl ProbeOptions {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            timeout: Duration::from_secs(
                config
                    .timeout_secs
                    .clamp(MIN_PROBE_TIMEOUT_SECS, MAX_PROBE_TIMEOUT_SECS),
            ),
            slow_threshold_ms: config.slow_threshold_ms,
            concurrency: config.concurrency.clamp(1, MAX_CONCURRENT_PROBES),
            interval: Duration::from_secs(config.interval_secs.max(1)),
        }
    }
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self::from_config(&ProbeConfig::default())
    }
}

/// Outcome of one probe (or of a recorded live request).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub provider_id: i64,
    pub provider_name: String,
    pub platform: Platform,
    pub status: ProbeStatus,
    pub sub_status: SubStatus,
    pub latency_ms: u64,
    pub http_code: Option<u16>,
    pub message: String,
    pub model: String,
    pub endpoint: String,
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Placeholder for a provider that has not been probed yet.
    pub fn missing(provider: &Provider, platform: &Platform) -> Self {
        Self {
            provider_id: provider.id,
            provider_name: provider.name.clone(),
            platform: platform.clone(),
            status: ProbeStatus::Missing,
            sub_status: SubStatus::None,
            latency_ms: 0,
            http_code: None,
            message: String::new(),
            model: String::new(),
            endpoint: String::new(),
            checked_at: Utc::now(),
        }
    }

    /// Skeleton for a live relay outcome; the caller fills in the status fields.
    pub fn for_request(provider: &Provider, platform: &Platform, model: &str, endpoint: &str) -> Self {
        Self {
            model: model.to_string(),
            endpoint: endpoint.to_string(),
            ..Self::missing(provider, platform)
        }
    }

    fn aborted(provider_id: i64, provider_name: String, platform: &Platform, message: &str) -> Self {
        Self {
            provider_id,
            provider_name,
            platform: platform.clone(),
            status: ProbeStatus::Unavailable,
            sub_status: SubStatus::NetworkError,
            latency_ms: 0,
            http_code: None,
            message: truncate_message(message),
            model: String::new(),
            endpoint: String::new(),
            checked_at: Utc::now(),
        }
    }
}

/// Flatten an error and its sources into one line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

pub struct ProbeEngine {
    registry: Arc<dyn ProviderRegistry>,
    transport: Arc<TransportManager>,
    availability: Arc<AvailabilityTracker>,
    settings: Arc<ConfigStore>,
    store: Option<Arc<dyn StateStore>>,
    options: RwLock<ProbeOptions>,
    results: RwLock<HashMap<(Platform, i64), ProbeResult>>,
    scheduler: PeriodicTask,
    sweep_in_progress: AtomicBool,
}

impl ProbeEngine {
    pub fn new(
        registry: Arc<dyn ProviderRegistry>,
        transport: Arc<TransportManager>,
        availability: Arc<AvailabilityTracker>,
        settings: Arc<ConfigStore>,
    ) -> Self {
        let options = ProbeOptions::from_config(&settings.get().probe);
        Self {
            registry,
            transport,
            availability,
            settings,
            store: None,
            options: RwLock::new(options),
            results: RwLock::new(HashMap::new()),
            scheduler: PeriodicTask::new("auto-probe"),
            sweep_in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the options wholesale, bypassing config clamping. Concurrency
    /// is still capped at `MAX_CONCURRENT_PROBES` when probes run.
    pub fn with_options(self, options: ProbeOptions) -> Self {
        *self.options.write() = options;
        self
    }

    pub fn options(&self) -> ProbeOptions {
        self.options.read().clone()
    }

    pub fn set_options(&self, options: ProbeOptions) {
        *self.options.write() = options;
    }

    /// Load persisted results into the cache.
    pub fn restore(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load_probe_results() {
            Ok(loaded) => {
                let mut results = self.results.write();
                for result in loaded {
                    results.insert((result.platform.clone(), result.provider_id), result);
                }
                tracing::info!("Restored {} probe results", results.len());
            }
            Err(e) => tracing::error!("Failed to load probe results: {}", e),
        }
    }

    /// Send one synthetic request and classify it. Does no bookkeeping.
    pub async fn probe_one(&self, provider: &Provider, platform: &Platform) -> ProbeResult {
        let options = self.options();
        let config = self.settings.get();
        let spec = build_test_request(provider, platform, config.platform_overrides(platform));
        let url = join_url(provider.base_url(), &spec.endpoint, None);

        let client = self.transport.client_with_timeout(options.timeout);
        let mut request = client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(&spec.body);
        for (name, value) in spec.auth.headers(&provider.api_key) {
            request = request.header(name, value);
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(options.timeout, async {
            let response = request.send().await?;
            let code = response.status().as_u16();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((code, body))
        })
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, sub_status, http_code, message) = match outcome {
            Err(_) => {
                let (status, sub) = classify_transport_failure(true);
                let message = format!("probe timed out after {}ms", options.timeout.as_millis());
                (status, sub, None, message)
            }
            Ok(Err(e)) => {
                let (status, sub) = classify_transport_error(&e);
                (status, sub, None, error_chain(&e))
            }
            Ok(Ok((code, body))) => {
                let http = classify_status(code, latency_ms, options.slow_threshold_ms);
                let (status, sub) = classify_content(http, &body, spec.success_marker);
                let message = if status == ProbeStatus::Unavailable {
                    String::from_utf8_lossy(&body).into_owned()
                } else {
                    String::new()
                };
                (status, sub, Some(code), message)
            }
        };

        tracing::debug!(
            "[{}] probe {} -> {}/{} ({}ms, model {})",
            platform,
            provider.name,
            status,
            sub_status,
            latency_ms,
            spec.model
        );

        ProbeResult {
            provider_id: provider.id,
            provider_name: provider.name.clone(),
            platform: platform.clone(),
            status,
            sub_status,
            latency_ms,
            http_code,
            message: truncate_message(&message),
            model: spec.model,
            endpoint: spec.endpoint,
            checked_at: Utc::now(),
        }
    }

    /// Cache, persist and account a result. Live relay outcomes come through here too.
    pub fn record(&self, result: &ProbeResult) {
        self.results
            .write()
            .insert((result.platform.clone(), result.provider_id), result.clone());
        if let Some(store) = &self.store {
            if let Err(e) = store.save_probe_result(result) {
                tracing::error!("Failed to persist probe result for {}: {}", result.provider_name, e);
            }
        }
        self.availability
            .apply_outcome(&result.platform, &result.provider_name, result.status);
    }

    /// Probe every monitored provider of `platform`, at most `concurrency` at a time.
    pub async fn probe_all(self: &Arc<Self>, platform: &Platform) -> Vec<ProbeResult> {
        let providers = match self.registry.load_providers(platform) {
            Ok(providers) => providers,
            Err(e) => {
                tracing::error!("[{}] failed to load providers for probing: {}", platform, e);
                return Vec::new();
            }
        };

        let targets: Vec<Provider> = providers
            .into_iter()
            .filter(|p| p.availability_monitor_enabled)
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let permits = self.options().concurrency.clamp(1, MAX_CONCURRENT_PROBES);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut handles = Vec::with_capacity(targets.len());
        for provider in targets {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let engine = Arc::clone(self);
            let task_platform = platform.clone();
            let meta = (provider.id, provider.name.clone());
            let handle = tokio::spawn(async move {
                let _permit = permit;
                engine.probe_one(&provider, &task_platform).await
            });
            handles.push((meta, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for ((id, name), handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("[{}] probe task for {} aborted: {}", platform, name, e);
                    ProbeResult::aborted(id, name, platform, &format!("probe task aborted: {}", e))
                }
            };
            self.record(&result);
            results.push(result);
        }

        let healthy = results
            .iter()
            .filter(|r| r.status == ProbeStatus::Available)
            .count();
        tracing::info!(
            "[{}] probed {} providers, {} available",
            platform,
            results.len(),
            healthy
        );
        results
    }

    /// On-demand probe of a single provider, with the same bookkeeping as `probe_all`.
    pub async fn probe_single(&self, platform: &Platform, provider_id: i64) -> Result<ProbeResult, ProbeError> {
        let providers = self.registry.load_providers(platform)?;
        let provider = providers
            .into_iter()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| ProbeError::ProviderNotFound {
                platform: platform.clone(),
                id: provider_id,
            })?;

        let result = self.probe_one(&provider, platform).await;
        self.record(&result);
        Ok(result)
    }

    /// One scheduled sweep over every known platform. Overlapping sweeps are skipped.
    pub async fn probe_all_platforms(self: &Arc<Self>) {
        if self.sweep_in_progress.swap(true, Ordering::SeqCst) {
            tracing::debug!("Previous probe sweep still running, skipping");
            return;
        }
        for platform in self.registry.platforms() {
            self.probe_all(&platform).await;
        }
        self.sweep_in_progress.store(false, Ordering::SeqCst);
    }

    /// Enable or disable the background probe loop. Enabling probes immediately.
    pub async fn set_auto_probe(self: &Arc<Self>, enabled: bool) -> bool {
        if !enabled {
            return self.scheduler.stop().await;
        }
        let engine: Weak<Self> = Arc::downgrade(self);
        let interval = self.options().interval;
        self.scheduler.start(interval, true, move || {
            let engine = engine.clone();
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.probe_all_platforms().await;
                }
            }
        })
    }

    pub fn auto_probe_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn get_result(&self, platform: &Platform, provider_id: i64) -> Option<ProbeResult> {
        self.results
            .read()
            .get(&(platform.clone(), provider_id))
            .cloned()
    }

    pub fn get_results(&self, platform: &Platform) -> Vec<ProbeResult> {
        let mut results: Vec<ProbeResult> = self
            .results
            .read()
            .values()
            .filter(|r| &r.platform == platform)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.provider_id);
        results
    }

    pub fn get_all_results(&self) -> Vec<ProbeResult> {
        let mut results: Vec<ProbeResult> = self.results.read().values().cloned().collect();
        results.sort_by(|a, b| {
            a.platform
                .cmp(&b.platform)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });
        results
    }
}
