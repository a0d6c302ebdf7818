// Error taxonomy for the relay core

use crate::proxy::Platform;

/// Errors raised while (re)building the shared HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("unsupported proxy type: {0}")]
    UnsupportedProxyType(String),

    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Errors raised by the provider registry collaborators.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider registry io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider registry parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors returned synchronously by on-demand probes.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("provider {id} not found for platform {platform}")]
    ProviderNotFound { platform: Platform, id: i64 },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Gateway-level failures surfaced to relay clients.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no provider available for {platform}")]
    NoProviderAvailable { platform: Platform },

    #[error("all providers failed for {platform}: {last_error}")]
    AllProvidersFailed { platform: Platform, last_error: String },

    #[error("request body too large")]
    BodyTooLarge,

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RelayError {
    /// Machine-readable error type used in the JSON error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::NoProviderAvailable { .. } => "no_provider_available",
            RelayError::AllProvidersFailed { .. } => "all_providers_failed",
            RelayError::BodyTooLarge => "request_too_large",
            RelayError::InvalidBody(_) => "invalid_request_error",
            RelayError::Registry(_) => "registry_error",
        }
    }
}
