//! Request validation and dispatch to the limiter manager.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::error::{RateSyncError, Result};
use crate::limiter::{Configuration, Decision, LimiterKind};
use crate::manager::LimiterManager;
use crate::metrics::{Metrics, MetricsSnapshot};

const KEY_REQUIRED: &str = "Valid key is required";

/// An admission check for `key` discriminated by `args`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckRequest {
    /// Tenant whose configuration applies
    pub key: String,
    /// Discriminators selecting one limiter of the tenant, order significant
    pub args: Vec<String>,
}

impl CheckRequest {
    /// Build from query pairs. Repeated `args` keep their order.
    pub fn from_query(pairs: &[(String, String)]) -> Self {
        let mut request = Self::default();
        for (name, value) in pairs {
            match name.as_str() {
                "key" if request.key.is_empty() => request.key = value.clone(),
                "args" | "args[]" => request.args.push(value.clone()),
                _ => {}
            }
        }
        request
    }

    /// Reject a missing or blank key.
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(RateSyncError::invalid("key", KEY_REQUIRED));
        }
        Ok(())
    }
}

/// Body of a configure call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureRequest {
    /// Tenant being configured
    #[serde(default)]
    pub key: String,
    /// Numeric algorithm code, 10 or 20
    #[serde(default)]
    pub limiter_type: Option<i64>,
    /// Algorithm parameters, decoded according to `limiter_type`
    #[serde(default)]
    pub configuration: Option<serde_json::Value>,
}

impl ConfigureRequest {
    /// Check every field and decode the algorithm parameters.
    pub fn validate(&self) -> Result<Configuration> {
        if self.key.trim().is_empty() {
            return Err(RateSyncError::invalid("key", KEY_REQUIRED));
        }
        let code = self
            .limiter_type
            .ok_or_else(|| RateSyncError::invalid("limiterType", "limiterType is required"))?;
        let kind = LimiterKind::from_code(code).ok_or_else(|| {
            RateSyncError::invalid("limiterType", format!("unknown limiter type {code}"))
        })?;
        let payload = self.configuration.as_ref().ok_or_else(|| {
            RateSyncError::invalid("configuration", "configuration key is required")
        })?;
        Configuration::from_payload(kind, payload)
    }
}

/// Front door of the rate limiter: validates requests, runs them against the
/// manager and keeps decision counters.
pub struct RateLimitService {
    manager: Arc<LimiterManager>,
    metrics: Metrics,
}

impl RateLimitService {
    /// Create a service over `manager` with zeroed metrics.
    pub fn new(manager: Arc<LimiterManager>) -> Self {
        Self {
            manager,
            metrics: Metrics::new(),
        }
    }

    /// The manager owning the live limiters.
    pub fn manager(&self) -> &Arc<LimiterManager> {
        &self.manager
    }

    /// Decide whether one unit of work is admitted.
    #[instrument(skip(self, request), fields(key = %request.key, args = request.args.len()))]
    pub async fn check(&self, request: &CheckRequest) -> Result<Decision> {
        request.validate()?;
        let started = Instant::now();

        let limiter = self.manager.access(&request.key, &request.args).await?;
        let decision = limiter.check();
        self.metrics.record(decision.allowed, started.elapsed());

        debug!(
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Rate limit decision made"
        );
        Ok(decision)
    }

    /// Validate and store a tenant configuration.
    #[instrument(skip(self, request), fields(key = %request.key))]
    pub async fn configure(&self, request: &ConfigureRequest) -> Result<()> {
        let config = request.validate()?;
        self.manager.configure(&request.key, config).await?;
        info!(key = %request.key, "Tenant configured");
        Ok(())
    }

    /// Current decision counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zero the decision counters.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}
