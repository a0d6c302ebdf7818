// Proxy module - platform model, transport and request shaping

pub mod resolver;
pub mod router;
pub mod transport;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub use resolver::AuthStyle;

/// Upstream API family a request or provider belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    Claude,
    Codex,
    Gemini,
    /// Arbitrary tool namespace served under `/custom/<tool>/...`
    Custom(String),
}

/// Hardcoded per-platform defaults, the last tier of the resolver.
#[derive(Debug, Clone, Copy)]
pub struct PlatformDefaults {
    pub endpoint: &'static str,
    pub test_model: &'static str,
    pub models_path: &'static str,
}

const CLAUDE_DEFAULTS: PlatformDefaults = PlatformDefaults {
    endpoint: "/v1/messages",
    test_model: "claude-haiku-4-5-20251001",
    models_path: "/v1/models",
};

const CODEX_DEFAULTS: PlatformDefaults = PlatformDefaults {
    endpoint: "/responses",
    test_model: "gpt-5-codex",
    models_path: "/models",
};

const GEMINI_DEFAULTS: PlatformDefaults = PlatformDefaults {
    endpoint: "/v1/chat/completions",
    test_model: "gemini-2.5-flash",
    models_path: "/v1/models",
};

const CUSTOM_DEFAULTS: PlatformDefaults = PlatformDefaults {
    endpoint: "/v1/chat/completions",
    test_model: "gpt-4o-mini",
    models_path: "/v1/models",
};

impl Platform {
    /// The built-in platforms, in the order background sweeps visit them.
    pub const BUILTIN: [Platform; 3] = [Platform::Claude, Platform::Codex, Platform::Gemini];

    pub fn defaults(&self) -> PlatformDefaults {
        match self {
            Platform::Claude => CLAUDE_DEFAULTS,
            Platform::Codex => CODEX_DEFAULTS,
            Platform::Gemini => GEMINI_DEFAULTS,
            Platform::Custom(_) => CUSTOM_DEFAULTS,
        }
    }

    pub fn default_auth_style(&self) -> AuthStyle {
        match self {
            Platform::Claude => AuthStyle::ApiKey,
            Platform::Codex | Platform::Gemini | Platform::Custom(_) => AuthStyle::Bearer,
        }
    }

    /// Key used for settings lookups and on-disk file names.
    pub fn storage_key(&self) -> String {
        match self {
            Platform::Claude => "claude".to_string(),
            Platform::Codex => "codex".to_string(),
            Platform::Gemini => "gemini".to_string(),
            Platform::Custom(tool) => format!("custom-{}", tool),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Claude => f.write_str("claude"),
            Platform::Codex => f.write_str("codex"),
            Platform::Gemini => f.write_str("gemini"),
            Platform::Custom(tool) => write!(f, "custom:{}", tool),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown platform: {0}")]
pub struct ParsePlatformError(pub String);

fn is_valid_tool_id(tool: &str) -> bool {
    !tool.is_empty()
        && tool
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl FromStr for Platform {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "claude" | "claude-code" | "anthropic" => Ok(Platform::Claude),
            "codex" => Ok(Platform::Codex),
            "gemini" => Ok(Platform::Gemini),
            other => {
                let tool = other
                    .strip_prefix("custom:")
                    .or_else(|| other.strip_prefix("custom-"));
                match tool {
                    Some(tool) if is_valid_tool_id(tool) => Ok(Platform::Custom(tool.to_string())),
                    _ => Err(ParsePlatformError(s.to_string())),
                }
            }
        }
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
