// Configuration module for the relay gateway

pub mod providers;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::proxy::Platform;

pub const DATA_DIR_ENV: &str = "CLI_RELAY_HOME";

/// Blacklist durations (minutes) the settings UI offers.
pub const ALLOWED_BLACKLIST_MINUTES: [u64; 4] = [5, 15, 30, 60];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Inbound keys accepted from the client tool. Empty means open.
    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub blacklist: BlacklistConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    /// Settings-level overrides keyed by platform storage key.
    #[serde(default)]
    pub platforms: HashMap<String, PlatformOverrides>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
            proxy: ProxyConfig::default(),
            blacklist: BlacklistConfig::default(),
            probe: ProbeConfig::default(),
            relay: RelayConfig::default(),
            platforms: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn platform_overrides(&self, platform: &Platform) -> Option<&PlatformOverrides> {
        self.platforms.get(&platform.storage_key())
    }

    pub fn listen_addr(&self) -> String {
        let host = if self.host.is_empty() {
            "127.0.0.1"
        } else {
            &self.host
        };
        format!("{}:{}", host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18100
}

fn default_data_dir() -> String {
    "~/.cli-relay".to_string()
}

fn default_true() -> bool {
    true
}

/// Outbound proxy settings; compared by value to decide whether to rebuild the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub proxy_address: String,
    /// `http` or `socks5`
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            use_proxy: false,
            proxy_address: String::new(),
            proxy_type: default_proxy_type(),
        }
    }
}

fn default_proxy_type() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BlacklistConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub level_enabled: bool,
    #[serde(default = "default_blacklist_threshold")]
    pub threshold: u32,
    #[serde(default = "default_blacklist_minutes")]
    pub duration_minutes: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level_enabled: false,
            threshold: default_blacklist_threshold(),
            duration_minutes: default_blacklist_minutes(),
        }
    }
}

impl BlacklistConfig {
    pub fn effective_threshold(&self) -> u32 {
        self.threshold.clamp(1, 9)
    }

    pub fn effective_duration(&self) -> chrono::Duration {
        let minutes = if ALLOWED_BLACKLIST_MINUTES.contains(&self.duration_minutes) {
            self.duration_minutes
        } else {
            tracing::warn!(
                "Unsupported blacklist duration {} min, using {} min",
                self.duration_minutes,
                default_blacklist_minutes()
            );
            default_blacklist_minutes()
        };
        chrono::Duration::minutes(minutes as i64)
    }
}

fn default_blacklist_threshold() -> u32 {
    3
}

fn default_blacklist_minutes() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProbeConfig {
    #[serde(default)]
    pub auto_enabled: bool,
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold_ms: u64,
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            auto_enabled: false,
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            slow_threshold_ms: default_slow_threshold(),
            concurrency: default_probe_concurrency(),
        }
    }
}

fn default_probe_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_slow_threshold() -> u64 {
    5000
}

fn default_probe_concurrency() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
    /// Per-request upstream timeout; 0 leaves live traffic unbounded.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformOverrides {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub test_model: Option<String>,
}

/// Process-wide settings store, constructed once and shared by handle.
pub struct ConfigStore {
    config: RwLock<AppConfig>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Load `config.yaml`, writing a default file when none exists.
    pub fn load_or_create(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_yaml::from_str(&content)?
        } else {
            let default_config = AppConfig::default();
            let content = serde_yaml::to_string(&default_config)?;
            std::fs::write(&path, content)?;
            default_config
        };

        tracing::info!("Config initialized from {:?}", path);
        Ok(Self {
            config: RwLock::new(config),
            path: Some(path),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            config: RwLock::new(config),
            path: None,
        }
    }

    pub fn get(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn blacklist(&self) -> BlacklistConfig {
        self.config.read().blacklist.clone()
    }

    pub fn update(&self, config: AppConfig) -> Result<()> {
        if let Some(path) = &self.path {
            let content = serde_yaml::to_string(&config)?;
            std::fs::write(path, content)?;
        }
        *self.config.write() = config;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Expand a configured data directory, honouring `~` and the env override.
pub fn resolve_data_dir(configured: Option<&str>) -> PathBuf {
    let raw = match configured {
        Some(dir) if !dir.trim().is_empty() => dir.trim().to_string(),
        _ => std::env::var(DATA_DIR_ENV).unwrap_or_else(|_| default_data_dir()),
    };

    if let Some(rest) = raw.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches(['/', '\\']));
        }
    }

    PathBuf::from(raw)
}
