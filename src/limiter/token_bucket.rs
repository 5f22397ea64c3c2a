//! Token bucket limiter.
//!
//! The bucket holds a continuous quantity of tokens refilled lazily on every
//! observation. A request is admitted while at least one whole token is
//! available.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    duration_to_nanos, parse_field, Algorithm, Decision, Nanos, MAX_SPAN_SECS, NANOS_PER_SEC,
};
use crate::error::{RateSyncError, Result};
use crate::store::Fields;

/// Seconds added to the drain time when computing the persisted TTL.
const TTL_GRACE_SECS: u64 = 2;

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBucketPayload {
    capacity: Option<f64>,
    refill_rate: Option<f64>,
}

impl TokenBucketConfig {
    /// Validate a `{"capacity": .., "refillRate": ..}` payload.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let raw: TokenBucketPayload = serde_json::from_value(payload.clone())
            .map_err(|e| RateSyncError::invalid("configuration", e.to_string()))?;
        let config = Self {
            capacity: positive("capacity", raw.capacity)?,
            refill_rate: positive("refillRate", raw.refill_rate)?,
        };
        if config.refill_secs() > MAX_SPAN_SECS as f64 {
            return Err(RateSyncError::invalid(
                "refillRate",
                format!("refillRate must refill capacity within {MAX_SPAN_SECS} seconds"),
            ));
        }
        Ok(config)
    }

    /// Seconds an empty bucket takes to fill up.
    fn refill_secs(&self) -> f64 {
        self.capacity / self.refill_rate
    }
}

fn positive(field: &str, value: Option<f64>) -> Result<f64> {
    match value {
        None => Err(RateSyncError::invalid(field, format!("{field} is required"))),
        Some(v) if v == 0.0 => Err(RateSyncError::invalid(field, format!("{field} is required"))),
        Some(v) if !v.is_finite() || v < 0.0 => {
            Err(RateSyncError::invalid(field, format!("{field} must be positive")))
        }
        Some(v) => Ok(v),
    }
}

/// State broadcast to peers after an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketUpdate {
    /// Tokens left after the admitted request
    pub tokens: f64,
    /// When the bucket was last refilled
    pub last_refill: Nanos,
}

/// Token bucket limiter state.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Nanos,
}

impl TokenBucket {
    /// Create a bucket with explicit runtime state.
    pub fn with_state(config: TokenBucketConfig, tokens: f64, last_refill: Nanos) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            tokens: tokens.clamp(0.0, config.capacity),
            last_refill,
        }
    }

    /// Tokens currently held, as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// When the bucket was last refilled.
    pub fn last_refill(&self) -> Nanos {
        self.last_refill
    }

    fn refill(&mut self, now: Nanos) {
        // Never move backwards, a peer's clock may be ahead of ours.
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill) as f64 / NANOS_PER_SEC as f64;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn reset_after(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_rate)
                .unwrap_or(Duration::MAX)
        }
    }
}

impl Algorithm for TokenBucket {
    type Config = TokenBucketConfig;
    type Update = TokenBucketUpdate;

    /// A configured bucket starts empty with a refill time at the epoch, so the
    /// first check fills it to capacity.
    fn configure(config: &TokenBucketConfig, _now: Nanos) -> Self {
        Self::with_state(*config, 0.0, 0)
    }

    fn config(&self) -> TokenBucketConfig {
        TokenBucketConfig {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }

    fn check(&mut self, now: Nanos) -> Decision {
        self.refill(now);

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }

        Decision {
            allowed,
            limit: self.capacity.floor() as u64,
            remaining: self.tokens.floor() as u64,
            reset_after: self.reset_after(),
        }
    }

    fn to_fields(&self) -> Fields {
        Fields::from([
            ("capacity".to_string(), self.capacity.to_string()),
            ("refillRate".to_string(), self.refill_rate.to_string()),
            ("tokens".to_string(), self.tokens.to_string()),
            ("lastRefill".to_string(), self.last_refill.to_string()),
        ])
    }

    fn from_fields(fields: &Fields) -> Result<Self> {
        let capacity: f64 = parse_field(fields, "capacity")?;
        let refill_rate: f64 = parse_field(fields, "refillRate")?;
        let config = TokenBucketConfig {
            capacity,
            refill_rate,
        };
        if !(capacity > 0.0 && refill_rate > 0.0) || config.refill_secs() > MAX_SPAN_SECS as f64 {
            return Err(RateSyncError::Codec(
                "token bucket parameters out of range".to_string(),
            ));
        }
        let tokens: f64 = parse_field(fields, "tokens")?;
        if !tokens.is_finite() {
            return Err(RateSyncError::Codec("tokens must be finite".to_string()));
        }
        Ok(Self::with_state(
            config,
            tokens,
            parse_field(fields, "lastRefill")?,
        ))
    }

    /// Time for an empty bucket to refill completely, plus a grace period.
    fn persist_ttl(&self) -> Duration {
        let drain_secs = self.config().refill_secs().ceil() as u64;
        Duration::from_secs(drain_secs.saturating_add(TTL_GRACE_SECS))
    }

    fn expiry_threshold(&self) -> Duration {
        self.persist_ttl()
    }

    fn is_expired(&self, now: Nanos) -> bool {
        now > self
            .last_refill
            .saturating_add(duration_to_nanos(self.persist_ttl()))
    }

    fn last_updated(&self) -> Nanos {
        self.last_refill
    }

    fn update(&self) -> TokenBucketUpdate {
        TokenBucketUpdate {
            tokens: self.tokens,
            last_refill: self.last_refill,
        }
    }

    /// Last writer wins: a strictly newer peer refill replaces local state.
    /// Consumption on other instances between updates is not reconciled.
    fn merge(&mut self, _peer: &str, update: TokenBucketUpdate) -> bool {
        if update.last_refill <= self.last_refill || !update.tokens.is_finite() {
            return false;
        }
        self.tokens = update.tokens.clamp(0.0, self.capacity);
        self.last_refill = update.last_refill;
        true
    }
}
