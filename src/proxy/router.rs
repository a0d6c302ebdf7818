// Request router - orders the providers a relay request may try

use std::sync::Arc;

use super::resolver::supports_model;
use super::Platform;
use crate::availability::AvailabilityTracker;
use crate::config::providers::{Provider, ProviderRegistry};
use crate::error::RegistryError;

pub struct ProviderRouter {
    registry: Arc<dyn ProviderRegistry>,
    availability: Arc<AvailabilityTracker>,
}

impl ProviderRouter {
    pub fn new(registry: Arc<dyn ProviderRegistry>, availability: Arc<AvailabilityTracker>) -> Self {
        Self {
            registry,
            availability,
        }
    }

    /// Enabled, non-blacklisted providers that serve `model`, lowest level first.
    /// Ties keep registry order.
    pub fn candidates(&self, platform: &Platform, model: Option<&str>) -> Result<Vec<Provider>, RegistryError> {
        let mut candidates: Vec<Provider> = self
            .registry
            .load_providers(platform)?
            .into_iter()
            .filter(|p| p.enabled)
            .filter(|p| model.map_or(true, |m| supports_model(p, m)))
            .filter(|p| {
                let blacklisted = self.availability.is_blacklisted(platform, &p.name);
                if blacklisted {
                    tracing::debug!("[{}] skipping blacklisted provider {}", platform, p.name);
                }
                !blacklisted
            })
            .collect();

        candidates.sort_by_key(|p| p.level);
        Ok(candidates)
    }
}
