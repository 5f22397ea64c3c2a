//! Tenant key to algorithm resolution.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{RateSyncError, Result};
use crate::limiter::{configuration_key, Configuration, LimiterKind, LIMITER_TYPE_FIELD};
use crate::store::StoreGateway;

/// Resolves tenant keys to their configured algorithm, caching what it learns
/// from the store.
pub struct KeyRegistry {
    store: Arc<dyn StoreGateway>,
    kinds: DashMap<String, LimiterKind>,
    configurations: DashMap<String, Configuration>,
}

impl KeyRegistry {
    /// Create a registry backed by `store`.
    pub fn new(store: Arc<dyn StoreGateway>) -> Self {
        Self {
            store,
            kinds: DashMap::new(),
            configurations: DashMap::new(),
        }
    }

    /// The algorithm configured for `tenant`.
    pub async fn resolve(&self, tenant: &str) -> Result<LimiterKind> {
        if let Some(kind) = self.kinds.get(tenant) {
            return Ok(*kind);
        }

        let raw = self
            .store
            .get_field(&configuration_key(tenant), LIMITER_TYPE_FIELD)
            .await?
            .ok_or_else(|| RateSyncError::KeyNotConfigured(tenant.to_string()))?;
        let kind = raw
            .parse()
            .ok()
            .and_then(LimiterKind::from_code)
            .ok_or_else(|| RateSyncError::Codec(format!("unknown limiter type {raw}")))?;

        debug!(tenant = %tenant, kind = ?kind, "Resolved limiter type");
        self.kinds.insert(tenant.to_string(), kind);
        Ok(kind)
    }

    /// The current configuration of `tenant`, read from the store.
    ///
    /// The cached copy is only served while the store is unavailable.
    pub async fn configuration(&self, tenant: &str) -> Result<Configuration> {
        match self.store.get_hash(&configuration_key(tenant)).await {
            Ok(Some(fields)) => {
                let config = Configuration::from_fields(&fields)?;
                self.remember(tenant, config);
                Ok(config)
            }
            Ok(None) => {
                self.forget(tenant);
                Err(RateSyncError::KeyNotConfigured(tenant.to_string()))
            }
            Err(e @ RateSyncError::StoreUnavailable(_)) => {
                let cached = self.configurations.get(tenant).map(|c| *c).ok_or(e)?;
                warn!(tenant = %tenant, "Store unavailable, using cached configuration");
                Ok(cached)
            }
            Err(e) => Err(e),
        }
    }

    /// Record a configuration known to be current.
    pub fn remember(&self, tenant: &str, config: Configuration) {
        self.kinds.insert(tenant.to_string(), config.kind());
        self.configurations.insert(tenant.to_string(), config);
    }

    fn forget(&self, tenant: &str) {
        self.kinds.remove(tenant);
        self.configurations.remove(tenant);
    }

    /// Number of tenants with a cached algorithm.
    pub fn cached(&self) -> usize {
        self.kinds.len()
    }
}
