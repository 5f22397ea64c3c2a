//! Admission algorithms and their shared contract.
//!
//! Every algorithm implements [`Algorithm`]; [`Limiter`] is the tagged variant
//! the rest of the crate works with. Adding an algorithm means adding a variant
//! here, nothing else dispatches on the kind.

use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RateSyncError, Result};
use crate::store::Fields;
use crate::sync::InstanceId;

mod key;
mod sliding_window;
mod token_bucket;

pub use key::{configuration_key, LimiterKey};
pub use sliding_window::{SlidingWindow, SlidingWindowConfig, SlidingWindowUpdate, MAX_WINDOW_SECS};
pub use token_bucket::{TokenBucket, TokenBucketConfig, TokenBucketUpdate};

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
pub type Nanos = i64;

/// Nanoseconds per second.
pub(crate) const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Longest span, in seconds, a limiter's parameters may imply: the token bucket
/// refill time or the sliding window size. Keeps every derived timestamp within
/// [`Nanos`].
pub const MAX_SPAN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Field of a stored configuration holding the algorithm code.
pub const LIMITER_TYPE_FIELD: &str = "limiterType";

/// Current wall-clock time. Wall clock (not a monotonic clock) so timestamps are
/// comparable between instances.
pub fn now_nanos() -> Nanos {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// The admission algorithm configured for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum LimiterKind {
    /// Continuously refilling bucket of tokens
    TokenBucket,
    /// Request log over a trailing time window
    SlidingWindow,
}

impl LimiterKind {
    /// Numeric code used on the wire and in storage.
    pub fn code(self) -> i64 {
        match self {
            LimiterKind::TokenBucket => 10,
            LimiterKind::SlidingWindow => 20,
        }
    }

    /// Parse a numeric code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            10 => Some(LimiterKind::TokenBucket),
            20 => Some(LimiterKind::SlidingWindow),
            _ => None,
        }
    }

    /// Short tag used in derived keys.
    pub fn tag(self) -> &'static str {
        match self {
            LimiterKind::TokenBucket => "tbl",
            LimiterKind::SlidingWindow => "sw",
        }
    }
}

impl TryFrom<i64> for LimiterKind {
    type Error = String;

    fn try_from(code: i64) -> std::result::Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown limiter type {code}"))
    }
}

impl From<LimiterKind> for i64 {
    fn from(kind: LimiterKind) -> Self {
        kind.code()
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the unit of work is admitted
    pub allowed: bool,
    /// Configured capacity
    pub limit: u64,
    /// Requests still admissible right now
    pub remaining: u64,
    /// Time until capacity frees up again
    pub reset_after: Duration,
}

/// Validated, algorithm-specific limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Configuration {
    /// Token bucket parameters
    TokenBucket(TokenBucketConfig),
    /// Sliding window parameters
    SlidingWindow(SlidingWindowConfig),
}

impl Configuration {
    /// The algorithm this configuration is for.
    pub fn kind(&self) -> LimiterKind {
        match self {
            Configuration::TokenBucket(_) => LimiterKind::TokenBucket,
            Configuration::SlidingWindow(_) => LimiterKind::SlidingWindow,
        }
    }

    /// Validate a JSON configuration payload for `kind`.
    pub fn from_payload(kind: LimiterKind, payload: &serde_json::Value) -> Result<Self> {
        match kind {
            LimiterKind::TokenBucket => {
                TokenBucketConfig::from_payload(payload).map(Configuration::TokenBucket)
            }
            LimiterKind::SlidingWindow => {
                SlidingWindowConfig::from_payload(payload).map(Configuration::SlidingWindow)
            }
        }
    }

    /// Stored representation: the algorithm code, its parameters and the runtime
    /// fields of a freshly configured limiter.
    pub fn to_fields(&self, now: Nanos) -> Fields {
        let mut fields = Limiter::configure(self, now).to_fields();
        fields.insert(LIMITER_TYPE_FIELD.to_string(), self.kind().code().to_string());
        fields
    }

    /// Decode a stored configuration.
    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let code: i64 = parse_field(fields, LIMITER_TYPE_FIELD)?;
        let kind = LimiterKind::from_code(code)
            .ok_or_else(|| RateSyncError::Codec(format!("unknown limiter type {code}")))?;
        Ok(Limiter::from_fields(kind, fields)?.configuration())
    }
}

/// Envelope of a cross-instance state update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope<U> {
    /// Identity of the publishing instance
    pub instance_id: String,
    /// Algorithm-specific state
    #[serde(flatten)]
    pub state: U,
}

/// What happened to a received update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The update changed local state
    Applied,
    /// The update was not newer than local state
    Stale,
    /// The update was published by this instance
    SelfOriginated,
    /// The payload could not be parsed
    Malformed,
}

/// Capabilities every admission algorithm provides.
pub trait Algorithm: Sized {
    /// Algorithm parameters
    type Config;
    /// State carried by cross-instance updates
    type Update: Serialize + DeserializeOwned;

    /// Build a freshly configured limiter.
    fn configure(config: &Self::Config, now: Nanos) -> Self;

    /// Parameters this limiter runs with.
    fn config(&self) -> Self::Config;

    /// Run one admission check at `now`.
    fn check(&mut self, now: Nanos) -> Decision;

    /// Encode the persisted state.
    fn to_fields(&self) -> Fields;

    /// Decode persisted state.
    fn from_fields(fields: &Fields) -> Result<Self>;

    /// Time to live of the persisted state.
    fn persist_ttl(&self) -> Duration;

    /// Idle time after which the limiter may be evicted.
    fn expiry_threshold(&self) -> Duration;

    /// Whether the limiter has been idle past its expiry threshold.
    fn is_expired(&self, now: Nanos) -> bool;

    /// Timestamp of the last state change.
    fn last_updated(&self) -> Nanos;

    /// Stored field that must be older than local state for a write to proceed.
    fn write_guard(&self) -> Option<(&'static str, Nanos)> {
        None
    }

    /// State to broadcast after an admitted request.
    fn update(&self) -> Self::Update;

    /// Merge an update received from `peer`. Returns whether local state changed.
    fn merge(&mut self, peer: &str, update: Self::Update) -> bool;
}

/// A limiter of any supported kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Limiter {
    /// Token bucket limiter
    TokenBucket(TokenBucket),
    /// Sliding window limiter
    SlidingWindow(SlidingWindow),
}

impl Limiter {
    /// Build a freshly configured limiter.
    pub fn configure(config: &Configuration, now: Nanos) -> Self {
        match config {
            Configuration::TokenBucket(c) => Limiter::TokenBucket(TokenBucket::configure(c, now)),
            Configuration::SlidingWindow(c) => {
                Limiter::SlidingWindow(SlidingWindow::configure(c, now))
            }
        }
    }

    /// Decode persisted state of the given kind.
    pub fn from_fields(kind: LimiterKind, fields: &Fields) -> Result<Self> {
        match kind {
            LimiterKind::TokenBucket => TokenBucket::from_fields(fields).map(Limiter::TokenBucket),
            LimiterKind::SlidingWindow => {
                SlidingWindow::from_fields(fields).map(Limiter::SlidingWindow)
            }
        }
    }

    /// The algorithm of this limiter.
    pub fn kind(&self) -> LimiterKind {
        match self {
            Limiter::TokenBucket(_) => LimiterKind::TokenBucket,
            Limiter::SlidingWindow(_) => LimiterKind::SlidingWindow,
        }
    }

    /// Parameters this limiter runs with.
    pub fn configuration(&self) -> Configuration {
        match self {
            Limiter::TokenBucket(l) => Configuration::TokenBucket(l.config()),
            Limiter::SlidingWindow(l) => Configuration::SlidingWindow(l.config()),
        }
    }

    /// Run one admission check at `now`.
    pub fn check(&mut self, now: Nanos) -> Decision {
        match self {
            Limiter::TokenBucket(l) => l.check(now),
            Limiter::SlidingWindow(l) => l.check(now),
        }
    }

    /// Encode the persisted state.
    pub fn to_fields(&self) -> Fields {
        match self {
            Limiter::TokenBucket(l) => l.to_fields(),
            Limiter::SlidingWindow(l) => l.to_fields(),
        }
    }

    /// Time to live of the persisted state.
    pub fn persist_ttl(&self) -> Duration {
        match self {
            Limiter::TokenBucket(l) => l.persist_ttl(),
            Limiter::SlidingWindow(l) => l.persist_ttl(),
        }
    }

    /// Idle time after which the limiter may be evicted.
    pub fn expiry_threshold(&self) -> Duration {
        match self {
            Limiter::TokenBucket(l) => l.expiry_threshold(),
            Limiter::SlidingWindow(l) => l.expiry_threshold(),
        }
    }

    /// Whether the limiter has been idle past its expiry threshold.
    pub fn is_expired(&self, now: Nanos) -> bool {
        match self {
            Limiter::TokenBucket(l) => l.is_expired(now),
            Limiter::SlidingWindow(l) => l.is_expired(now),
        }
    }

    /// Timestamp of the last state change.
    pub fn last_updated(&self) -> Nanos {
        match self {
            Limiter::TokenBucket(l) => l.last_updated(),
            Limiter::SlidingWindow(l) => l.last_updated(),
        }
    }

    /// Stored field that must be older than local state for a write to proceed.
    pub fn write_guard(&self) -> Option<(&'static str, Nanos)> {
        match self {
            Limiter::TokenBucket(l) => l.write_guard(),
            Limiter::SlidingWindow(l) => l.write_guard(),
        }
    }

    /// Serialize the current state as an update published by `instance`.
    pub fn encode_update(&self, instance: &InstanceId) -> Result<String> {
        let payload = match self {
            Limiter::TokenBucket(l) => serde_json::to_string(&SyncEnvelope {
                instance_id: instance.to_string(),
                state: l.update(),
            })?,
            Limiter::SlidingWindow(l) => serde_json::to_string(&SyncEnvelope {
                instance_id: instance.to_string(),
                state: l.update(),
            })?,
        };
        Ok(payload)
    }

    /// Parse and merge an update received on this limiter's channel.
    pub fn apply_update(&mut self, local: &InstanceId, payload: &str) -> MergeOutcome {
        match self {
            Limiter::TokenBucket(l) => apply(l, local, payload),
            Limiter::SlidingWindow(l) => apply(l, local, payload),
        }
    }
}

fn apply<A: Algorithm>(limiter: &mut A, local: &InstanceId, payload: &str) -> MergeOutcome {
    let envelope: SyncEnvelope<A::Update> = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(_) => return MergeOutcome::Malformed,
    };
    if envelope.instance_id == local.as_str() {
        return MergeOutcome::SelfOriginated;
    }
    if limiter.merge(&envelope.instance_id, envelope.state) {
        MergeOutcome::Applied
    } else {
        MergeOutcome::Stale
    }
}

/// Parse a required stored field.
pub(crate) fn parse_field<T: FromStr>(fields: &Fields, name: &str) -> Result<T> {
    let raw = fields
        .get(name)
        .ok_or_else(|| RateSyncError::Codec(format!("missing field {name}")))?;
    raw.parse()
        .map_err(|_| RateSyncError::Codec(format!("invalid value for {name}: {raw}")))
}

/// Convert a duration to nanoseconds, saturating at [`Nanos::MAX`].
pub(crate) fn duration_to_nanos(span: Duration) -> Nanos {
    Nanos::try_from(span.as_nanos()).unwrap_or(Nanos::MAX)
}

/// Convert a non-negative nanosecond span to a duration.
pub(crate) fn nanos_to_duration(nanos: Nanos) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}
