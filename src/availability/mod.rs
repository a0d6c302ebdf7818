// Availability state machine - consecutive failures and timed blacklisting

pub mod notify;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::ConfigStore;
use crate::db::StateStore;
use crate::probe::classify::ProbeStatus;
use crate::proxy::Platform;
use crate::scheduler::PeriodicTask;
use notify::{AvailabilityEvent, NotificationSink, TracingNotifier};

pub const RECOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_BLACKLIST_LEVEL: u32 = 5;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityEntry {
    pub platform: Platform,
    pub provider: String,
    pub consecutive_failures: u32,
    pub blacklisted_until: Option<DateTime<Utc>>,
    /// Escalation tier when level-based blacklisting is on; 0 otherwise.
    pub blacklist_level: u32,
    pub last_status: ProbeStatus,
    pub updated_at: DateTime<Utc>,
}

impl AvailabilityEntry {
    fn new(platform: &Platform, provider: &str, now: DateTime<Utc>) -> Self {
        Self {
            platform: platform.clone(),
            provider: provider.to_string(),
            consecutive_failures: 0,
            blacklisted_until: None,
            blacklist_level: 0,
            last_status: ProbeStatus::Missing,
            updated_at: now,
        }
    }

    pub fn is_blacklisted_at(&self, now: DateTime<Utc>) -> bool {
        self.blacklisted_until.map(|until| until > now).unwrap_or(false)
    }
}

type EntryKey = (Platform, String);

/// Per (platform, provider) failure accounting shared by probes and live traffic.
pub struct AvailabilityTracker {
    entries: RwLock<HashMap<EntryKey, AvailabilityEntry>>,
    settings: Arc<ConfigStore>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn StateStore>>,
    notifier: Arc<dyn NotificationSink>,
    sweep: PeriodicTask,
}

impl AvailabilityTracker {
    pub fn new(settings: Arc<ConfigStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            settings,
            clock: Arc::new(SystemClock),
            store: None,
            notifier: Arc::new(TracingNotifier),
            sweep: PeriodicTask::new("blacklist-recovery"),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Load persisted entries, replacing anything in memory.
    pub fn restore(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load_availability() {
            Ok(loaded) => {
                let count = loaded.len();
                let mut entries = self.entries.write();
                entries.clear();
                for entry in loaded {
                    entries.insert((entry.platform.clone(), entry.provider.clone()), entry);
                }
                tracing::info!("Restored {} availability entries", count);
            }
            Err(e) => tracing::error!("Failed to load availability state: {}", e),
        }
    }

    /// Reset the failure streak. An active blacklist is left to expire.
    pub fn record_success(&self, platform: &Platform, provider: &str) {
        let now = self.clock.now();
        {
            let mut entries = self.entries.write();
            let entry = entries
                .entry((platform.clone(), provider.to_string()))
                .or_insert_with(|| AvailabilityEntry::new(platform, provider, now));
            entry.consecutive_failures = 0;
            if !entry.is_blacklisted_at(now) {
                entry.blacklist_level = 0;
            }
            entry.last_status = ProbeStatus::Available;
            entry.updated_at = now;
            self.persist(entry);
        }
    }

    /// Count a failure; returns `true` when this call put the provider on the blacklist.
    pub fn record_failure(&self, platform: &Platform, provider: &str) -> bool {
        let settings = self.settings.blacklist();
        let now = self.clock.now();

        let (snapshot, event) = {
            let mut entries = self.entries.write();
            let entry = entries
                .entry((platform.clone(), provider.to_string()))
                .or_insert_with(|| AvailabilityEntry::new(platform, provider, now));
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.last_status = ProbeStatus::Unavailable;
            entry.updated_at = now;

            let mut event = None;
            if settings.enabled
                && !entry.is_blacklisted_at(now)
                && entry.consecutive_failures >= settings.effective_threshold()
            {
                let base = settings.effective_duration();
                let duration = if settings.level_enabled {
                    entry.blacklist_level = (entry.blacklist_level + 1).min(MAX_BLACKLIST_LEVEL);
                    base * 2i32.pow(entry.blacklist_level - 1)
                } else {
                    entry.blacklist_level = 0;
                    base
                };
                let until = now + duration;
                entry.blacklisted_until = Some(until);
                event = Some(AvailabilityEvent::Blacklisted {
                    platform: platform.clone(),
                    provider: provider.to_string(),
                    until,
                    level: entry.blacklist_level,
                    consecutive_failures: entry.consecutive_failures,
                });
            }
            self.persist(entry);
            (entry.clone(), event)
        };

        match event {
            Some(event) => {
                tracing::warn!(
                    "[{}] provider {} blacklisted until {} after {} consecutive failures",
                    platform,
                    provider,
                    snapshot
                        .blacklisted_until
                        .map(|u| u.to_rfc3339())
                        .unwrap_or_default(),
                    snapshot.consecutive_failures
                );
                self.notifier.notify(&event);
                true
            }
            None => false,
        }
    }

    /// Feed a classified outcome. Degraded and Missing are neutral signals.
    pub fn apply_outcome(&self, platform: &Platform, provider: &str, status: ProbeStatus) {
        match status {
            ProbeStatus::Available => self.record_success(platform, provider),
            ProbeStatus::Unavailable => {
                self.record_failure(platform, provider);
            }
            ProbeStatus::Degraded | ProbeStatus::Missing => {
                let now = self.clock.now();
                if let Some(entry) = self
                    .entries
                    .write()
                    .get_mut(&(platform.clone(), provider.to_string()))
                {
                    entry.last_status = status;
                    entry.updated_at = now;
                }
            }
        }
    }

    pub fn is_blacklisted(&self, platform: &Platform, provider: &str) -> bool {
        if !self.settings.blacklist().enabled {
            return false;
        }
        let now = self.clock.now();
        self.entries
            .read()
            .get(&(platform.clone(), provider.to_string()))
            .map(|entry| entry.is_blacklisted_at(now))
            .unwrap_or(false)
    }

    /// Lift every expired blacklist and reset its failure streak.
    pub fn auto_recover_expired(&self) -> Vec<AvailabilityEntry> {
        let now = self.clock.now();
        let recovered: Vec<AvailabilityEntry> = {
            let mut entries = self.entries.write();
            entries
                .values_mut()
                .filter(|entry| matches!(entry.blacklisted_until, Some(until) if until <= now))
                .map(|entry| {
                    entry.blacklisted_until = None;
                    entry.consecutive_failures = 0;
                    entry.updated_at = now;
                    self.persist(entry);
                    entry.clone()
                })
                .collect()
        };

        for entry in &recovered {
            tracing::info!(
                "[{}] provider {} recovered from blacklist",
                entry.platform,
                entry.provider
            );
            self.notifier.notify(&AvailabilityEvent::Recovered {
                platform: entry.platform.clone(),
                provider: entry.provider.clone(),
                manual: false,
            });
        }
        recovered
    }

    /// Manually lift a blacklist. Returns `false` for unknown providers.
    pub fn clear(&self, platform: &Platform, provider: &str) -> bool {
        let now = self.clock.now();
        {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(&(platform.clone(), provider.to_string())) else {
                return false;
            };
            entry.blacklisted_until = None;
            entry.consecutive_failures = 0;
            entry.blacklist_level = 0;
            entry.updated_at = now;
            self.persist(entry);
        }
        tracing::info!("[{}] provider {} manually removed from blacklist", platform, provider);
        self.notifier.notify(&AvailabilityEvent::Recovered {
            platform: platform.clone(),
            provider: provider.to_string(),
            manual: true,
        });
        true
    }

    pub fn entry(&self, platform: &Platform, provider: &str) -> Option<AvailabilityEntry> {
        self.entries
            .read()
            .get(&(platform.clone(), provider.to_string()))
            .cloned()
    }

    pub fn consecutive_failures(&self, platform: &Platform, provider: &str) -> u32 {
        self.entry(platform, provider)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<AvailabilityEntry> {
        let mut entries: Vec<AvailabilityEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| {
            a.platform
                .cmp(&b.platform)
                .then_with(|| a.provider.cmp(&b.provider))
        });
        entries
    }

    /// Start the one-minute expiry sweep.
    pub fn start_recovery_sweep(self: &Arc<Self>) -> bool {
        self.start_recovery_sweep_every(RECOVERY_SWEEP_INTERVAL)
    }

    pub fn start_recovery_sweep_every(self: &Arc<Self>, period: Duration) -> bool {
        let tracker: Weak<Self> = Arc::downgrade(self);
        self.sweep.start(period, false, move || {
            let tracker = tracker.clone();
            async move {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.auto_recover_expired();
                }
            }
        })
    }

    pub async fn stop_recovery_sweep(&self) -> bool {
        self.sweep.stop().await
    }

    /// Callers hold the entries write lock so rows reach the store in the
    /// same order the in-memory state changed.
    fn persist(&self, entry: &AvailabilityEntry) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_availability(entry) {
                tracing::error!(
                    "Failed to persist availability for {}/{}: {}",
                    entry.platform,
                    entry.provider,
                    e
                );
            }
        }
    }
}
