// Provider registry - configured upstream endpoints per platform

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::RegistryError;
use crate::proxy::{AuthStyle, Platform};

/// A configured upstream endpoint. Read-only input to the relay core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Priority tier; 1 is tried first.
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Models this provider serves; empty means any.
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    #[serde(default)]
    pub auth_type: Option<AuthStyle>,
    #[serde(default = "default_true")]
    pub availability_monitor_enabled: bool,
    #[serde(default)]
    pub test_model: Option<String>,
    #[serde(default)]
    pub test_endpoint: Option<String>,
    #[serde(default)]
    pub test_auth_type: Option<AuthStyle>,
}

fn default_true() -> bool {
    true
}

fn default_level() -> u32 {
    1
}

impl Provider {
    pub fn new(id: i64, name: impl Into<String>, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            enabled: true,
            level: default_level(),
            model_mapping: HashMap::new(),
            supported_models: Vec::new(),
            api_endpoint: None,
            auth_type: None,
            availability_monitor_enabled: true,
            test_model: None,
            test_endpoint: None,
            test_auth_type: None,
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    /// Base URL without trailing slashes.
    pub fn base_url(&self) -> &str {
        self.api_url.trim().trim_end_matches('/')
    }
}

/// Source of truth for configured providers.
pub trait ProviderRegistry: Send + Sync {
    /// Returns a snapshot; callers never mutate the registry's copy.
    fn load_providers(&self, platform: &Platform) -> Result<Vec<Provider>, RegistryError>;

    fn save_providers(&self, platform: &Platform, providers: &[Provider]) -> Result<(), RegistryError>;

    /// Every platform with providers configured, built-ins first.
    fn platforms(&self) -> Vec<Platform> {
        Platform::BUILTIN.to_vec()
    }
}

fn with_builtins(mut custom: Vec<Platform>) -> Vec<Platform> {
    custom.sort();
    custom.dedup();
    let mut platforms = Platform::BUILTIN.to_vec();
    platforms.extend(custom.into_iter().filter(|p| matches!(p, Platform::Custom(_))));
    platforms
}

/// Stores each platform's providers as `<dir>/<platform-key>.json`.
pub struct FileProviderRegistry {
    dir: PathBuf,
}

impl FileProviderRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, platform: &Platform) -> PathBuf {
        self.dir.join(format!("{}.json", platform.storage_key()))
    }
}

impl ProviderRegistry for FileProviderRegistry {
    fn load_providers(&self, platform: &Platform) -> Result<Vec<Provider>, RegistryError> {
        let path = self.file_for(platform);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save_providers(&self, platform: &Platform, providers: &[Provider]) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(providers)?;
        std::fs::write(self.file_for(platform), content)?;
        tracing::debug!("Saved {} providers for {}", providers.len(), platform);
        Ok(())
    }

    fn platforms(&self) -> Vec<Platform> {
        let custom = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let stem = name.strip_suffix(".json")?;
                    stem.starts_with("custom-")
                        .then(|| stem.parse::<Platform>().ok())
                        .flatten()
                })
                .collect(),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to list provider dir {:?}: {}", self.dir, e);
                }
                Vec::new()
            }
        };
        with_builtins(custom)
    }
}

/// Registry held entirely in memory.
#[derive(Default)]
pub struct MemoryProviderRegistry {
    providers: RwLock<HashMap<Platform, Vec<Provider>>>,
}

impl MemoryProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_providers(self, platform: Platform, providers: Vec<Provider>) -> Self {
        self.providers.write().insert(platform, providers);
        self
    }
}

impl ProviderRegistry for MemoryProviderRegistry {
    fn load_providers(&self, platform: &Platform) -> Result<Vec<Provider>, RegistryError> {
        Ok(self.providers.read().get(platform).cloned().unwrap_or_default())
    }

    fn save_providers(&self, platform: &Platform, providers: &[Provider]) -> Result<(), RegistryError> {
        self.providers
            .write()
            .insert(platform.clone(), providers.to_vec());
        Ok(())
    }

    fn platforms(&self) -> Vec<Platform> {
        with_builtins(self.providers.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_json_uses_camel_case_and_defaults() {
        let json = r#"{
            "id": 7,
            "name": "relay-a",
            "apiUrl": "https://a.example.com/",
            "apiKey": "sk-1",
            "modelMapping": {"gpt-4o-mini": "openai/gpt-4o-mini"},
            "authType": "bearer",
            "testAuthType": "X-Relay-Key"
        }"#;
        let provider: Provider = serde_json::from_str(json).unwrap();
        assert!(provider.enabled);
        assert_eq!(provider.level, 1);
        assert!(provider.availability_monitor_enabled);
        assert_eq!(provider.base_url(), "https://a.example.com");
        assert_eq!(provider.auth_type, Some(AuthStyle::Bearer));
        assert_eq!(
            provider.test_auth_type,
            Some(AuthStyle::Custom("X-Relay-Key".to_string()))
        );
    }

    #[test]
    fn file_registry_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileProviderRegistry::new(dir.path().join("providers"));
        assert!(registry.load_providers(&Platform::Codex).unwrap().is_empty());

        let providers = vec![
            Provider::new(1, "a", "https://a.example.com", "k1"),
            Provider::new(2, "b", "https://b.example.com", "k2").with_level(2),
        ];
        registry.save_providers(&Platform::Codex, &providers).unwrap();
        assert_eq!(registry.load_providers(&Platform::Codex).unwrap(), providers);
        assert!(registry.load_providers(&Platform::Claude).unwrap().is_empty());
    }

    #[test]
    fn platforms_include_custom_tools_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileProviderRegistry::new(dir.path());
        assert_eq!(registry.platforms(), Platform::BUILTIN.to_vec());

        let droid = Platform::Custom("droid".into());
        registry.save_providers(&droid, &[]).unwrap();
        registry.save_providers(&Platform::Claude, &[]).unwrap();
        std::fs::write(dir.path().join("custom-..json"), "[]").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let platforms = registry.platforms();
        assert_eq!(platforms.len(), 4);
        assert_eq!(platforms[3], droid);
    }

    #[test]
    fn file_registry_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("claude.json"), "{not json").unwrap();
        let registry = FileProviderRegistry::new(dir.path());
        assert!(matches!(
            registry.load_providers(&Platform::Claude),
            Err(RegistryError::Parse(_))
        ));
    }
}
