//! Sliding window limiter.
//!
//! Keeps a sorted log of admitted request timestamps and admits while fewer
//! than `capacity` of them fall inside the trailing window.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    duration_to_nanos, nanos_to_duration, parse_field, Algorithm, Decision, Nanos, MAX_SPAN_SECS,
};
use crate::error::{RateSyncError, Result};
use crate::store::Fields;

/// Seconds added to twice the window when computing the persisted TTL.
const TTL_GRACE_SECS: u64 = 2;

/// Largest window; twice the window must still fit the span limit.
pub const MAX_WINDOW_SECS: u64 = MAX_SPAN_SECS / 2;

/// Sliding window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    /// Maximum requests admitted within one window
    pub capacity: u64,
    /// Length of the trailing window, whole seconds
    pub window_size: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlidingWindowPayload {
    capacity: Option<f64>,
    window_size: Option<f64>,
}

impl SlidingWindowConfig {
    /// Validate a `{"capacity": .., "windowSize": <seconds>}` payload.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let raw: SlidingWindowPayload = serde_json::from_value(payload.clone())
            .map_err(|e| RateSyncError::invalid("configuration", e.to_string()))?;
        let capacity = whole_positive("capacity", raw.capacity)?;
        let window_secs = whole_positive("windowSize", raw.window_size)?;
        if window_secs > MAX_WINDOW_SECS {
            return Err(RateSyncError::invalid(
                "windowSize",
                format!("windowSize must be at most {MAX_WINDOW_SECS} seconds"),
            ));
        }
        Ok(Self {
            capacity,
            window_size: Duration::from_secs(window_secs),
        })
    }
}

fn whole_positive(field: &str, value: Option<f64>) -> Result<u64> {
    match value {
        None => Err(RateSyncError::invalid(field, format!("{field} is required"))),
        Some(v) if v == 0.0 => Err(RateSyncError::invalid(field, format!("{field} is required"))),
        Some(v) if !v.is_finite() || v < 0.0 => {
            Err(RateSyncError::invalid(field, format!("{field} must be positive")))
        }
        Some(v) if v.fract() != 0.0 => {
            Err(RateSyncError::invalid(field, format!("{field} must be a whole number")))
        }
        Some(v) => Ok(v as u64),
    }
}

/// State broadcast to peers after an admitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidingWindowUpdate {
    /// Admitted request timestamps known to the publisher
    pub request_logs: Vec<Nanos>,
    /// When the publisher last changed its state
    pub last_updated: Nanos,
}

/// Sliding window limiter state.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindow {
    capacity: u64,
    window_size: Duration,
    /// Sorted ascending.
    log: Vec<Nanos>,
    last_updated: Nanos,
    /// Last merged `last_updated` per peer instance.
    cursors: HashMap<String, Nanos>,
}

impl SlidingWindow {
    /// Create a window with an explicit request log.
    pub fn with_state(config: SlidingWindowConfig, mut log: Vec<Nanos>, last_updated: Nanos) -> Self {
        log.sort_unstable();
        Self {
            capacity: config.capacity,
            window_size: config.window_size,
            log,
            last_updated,
            cursors: HashMap::new(),
        }
    }

    /// Logged request timestamps, oldest first.
    pub fn log(&self) -> &[Nanos] {
        &self.log
    }

    /// Last merged timestamp of `peer`, if any update from it was merged.
    pub fn cursor(&self, peer: &str) -> Option<Nanos> {
        self.cursors.get(peer).copied()
    }

    fn window_nanos(&self) -> Nanos {
        duration_to_nanos(self.window_size)
    }

    fn prune(&mut self, now: Nanos) {
        let cutoff = now.saturating_sub(self.window_nanos());
        self.log.retain(|t| *t > cutoff);
    }

    /// Insert keeping the log sorted. Returns false for an exact duplicate.
    fn insert(&mut self, at: Nanos) -> bool {
        match self.log.binary_search(&at) {
            Ok(_) => false,
            Err(pos) => {
                self.log.insert(pos, at);
                true
            }
        }
    }
}

impl Algorithm for SlidingWindow {
    type Config = SlidingWindowConfig;
    type Update = SlidingWindowUpdate;

    fn configure(config: &SlidingWindowConfig, now: Nanos) -> Self {
        Self::with_state(*config, Vec::new(), now)
    }

    fn config(&self) -> SlidingWindowConfig {
        SlidingWindowConfig {
            capacity: self.capacity,
            window_size: self.window_size,
        }
    }

    fn check(&mut self, now: Nanos) -> Decision {
        self.prune(now);

        let allowed = (self.log.len() as u64) < self.capacity;
        if allowed && !self.insert(now) {
            // Same nanosecond as an existing entry, still one request.
            let pos = self.log.partition_point(|t| *t <= now);
            self.log.insert(pos, now);
        }
        self.last_updated = self.last_updated.max(now);

        let reset_after = self
            .log
            .first()
            .map(|oldest| {
                nanos_to_duration(oldest.saturating_add(self.window_nanos()).saturating_sub(now))
            })
            .unwrap_or(Duration::ZERO);

        Decision {
            allowed,
            limit: self.capacity,
            remaining: self.capacity.saturating_sub(self.log.len() as u64),
            reset_after,
        }
    }

    fn to_fields(&self) -> Fields {
        let log = serde_json::to_string(&self.log).unwrap_or_else(|_| "[]".to_string());
        Fields::from([
            ("capacity".to_string(), self.capacity.to_string()),
            ("windowSize".to_string(), self.window_size.as_secs().to_string()),
            ("requestLog".to_string(), log),
            ("lastUpdated".to_string(), self.last_updated.to_string()),
        ])
    }

    fn from_fields(fields: &Fields) -> Result<Self> {
        let capacity: u64 = parse_field(fields, "capacity")?;
        let window_secs: u64 = parse_field(fields, "windowSize")?;
        if capacity == 0 || window_secs == 0 || window_secs > MAX_WINDOW_SECS {
            return Err(RateSyncError::Codec(
                "sliding window parameters out of range".to_string(),
            ));
        }
        let log: Vec<Nanos> = match fields.get("requestLog") {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        Ok(Self::with_state(
            SlidingWindowConfig {
                capacity,
                window_size: Duration::from_secs(window_secs),
            },
            log,
            parse_field(fields, "lastUpdated")?,
        ))
    }

    fn persist_ttl(&self) -> Duration {
        self.expiry_threshold()
            .saturating_add(Duration::from_secs(TTL_GRACE_SECS))
    }

    fn expiry_threshold(&self) -> Duration {
        self.window_size.saturating_mul(2)
    }

    fn is_expired(&self, now: Nanos) -> bool {
        now.saturating_sub(self.last_updated) > self.window_nanos().saturating_mul(2)
    }

    fn last_updated(&self) -> Nanos {
        self.last_updated
    }

    fn write_guard(&self) -> Option<(&'static str, Nanos)> {
        Some(("lastUpdated", self.last_updated))
    }

    fn update(&self) -> SlidingWindowUpdate {
        SlidingWindowUpdate {
            request_logs: self.log.clone(),
            last_updated: self.last_updated,
        }
    }

    /// Merge the entries of a strictly newer peer update that were not covered
    /// by the previous update merged from the same peer.
    fn merge(&mut self, peer: &str, update: SlidingWindowUpdate) -> bool {
        if update.last_updated <= self.last_updated {
            return false;
        }

        let cutoff = self.cursors.get(peer).copied().unwrap_or(0);
        for at in update.request_logs.into_iter().filter(|at| *at > cutoff) {
            // Entries this instance already holds come back echoed in peer logs.
            self.insert(at);
        }

        self.last_updated = update.last_updated;
        self.cursors.insert(peer.to_string(), update.last_updated);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::NANOS_PER_SEC;
    use serde_json::json;

    const SEC: Nanos = NANOS_PER_SEC;
    const MS: Nanos = 1_000_000;
    const T0: Nanos = 1_700_000_000 * SEC;

    fn config(capacity: u64, window_secs: u64) -> SlidingWindowConfig {
        SlidingWindowConfig {
            capacity,
            window_size: Duration::from_secs(window_secs),
        }
    }

    #[test]
    fn test_capacity_then_window_slides() {
        let mut window = SlidingWindow::configure(&config(3, 2), T0);

        for i in 0..3 {
            assert!(window.check(T0 + i * MS).allowed, "Request {} should be allowed", i + 1);
        }
        let denied = window.check(T0 + 3 * MS);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_after, Duration::from_millis(1997));

        assert!(window.check(T0 + 2100 * MS).allowed);
    }

    #[test]
    fn test_denied_requests_are_not_logged() {
        let mut window = SlidingWindow::configure(&config(1, 10), T0);
        assert!(window.check(T0).allowed);
        assert!(!window.check(T0 + SEC).allowed);
        assert_eq!(window.log(), &[T0]);
        assert_eq!(window.last_updated(), T0 + SEC);
    }

    #[test]
    fn test_no_trailing_window_exceeds_capacity() {
        let mut window = SlidingWindow::configure(&config(4, 1), T0);
        let mut admitted = Vec::new();
        // Uneven arrivals, 37ms apart, over six seconds.
        let mut now = T0;
        while now < T0 + 6 * SEC {
            if window.check(now).allowed {
                admitted.push(now);
            }
            now += 37 * MS;
        }

        for &end in &admitted {
            let in_window = admitted
                .iter()
                .filter(|t| **t > end - SEC && **t <= end)
                .count();
            assert!(in_window <= 4, "{in_window} requests in window ending {end}");
        }
        assert!(admitted.len() >= 4 * 5);
    }

    #[test]
    fn test_prune_keeps_entries_inside_window() {
        let mut window = SlidingWindow::with_state(
            config(10, 2),
            vec![T0 - 5 * SEC, T0 - 2 * SEC, T0 - SEC, T0 - MS],
            T0 - MS,
        );
        window.check(T0);
        assert_eq!(window.log(), &[T0 - SEC, T0 - MS, T0]);
        assert!(window.log().iter().all(|t| *t > T0 - 2 * SEC && *t <= T0));
    }

    #[test]
    fn test_merge_newer_peer_update() {
        let mut window = SlidingWindow::configure(&config(5, 10), T0);
        window.check(T0 + MS);

        let update = SlidingWindowUpdate {
            request_logs: vec![T0 + 2 * MS],
            last_updated: T0 + 2 * MS,
        };
        assert!(window.merge("peer-a", update));
        assert_eq!(window.log(), &[T0 + MS, T0 + 2 * MS]);
        assert_eq!(window.last_updated(), T0 + 2 * MS);
        assert_eq!(window.cursor("peer-a"), Some(T0 + 2 * MS));
    }

    #[test]
    fn test_merge_ignores_stale_update() {
        let mut window = SlidingWindow::configure(&config(5, 10), T0);
        window.check(T0 + 5 * MS);

        let update = SlidingWindowUpdate {
            request_logs: vec![T0 + MS],
            last_updated: T0 + 5 * MS,
        };
        assert!(!window.merge("peer-a", update));
        assert_eq!(window.log(), &[T0 + 5 * MS]);
        assert_eq!(window.cursor("peer-a"), None);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut window = SlidingWindow::configure(&config(5, 10), T0);
        let update = SlidingWindowUpdate {
            request_logs: vec![T0 + MS, T0 + 2 * MS],
            last_updated: T0 + 2 * MS,
        };

        window.merge("peer-a", update.clone());
        let once = window.clone();
        window.merge("peer-a", update);
        assert_eq!(window, once);
    }

    #[test]
    fn test_cursor_prevents_recounting_peer_entries() {
        let mut window = SlidingWindow::configure(&config(10, 10), T0);

        window.merge(
            "peer-a",
            SlidingWindowUpdate {
                request_logs: vec![T0 + MS],
                last_updated: T0 + MS,
            },
        );
        // The peer's next update repeats its earlier entry.
        window.merge(
            "peer-a",
            SlidingWindowUpdate {
                request_logs: vec![T0 + MS, T0 + 3 * MS],
                last_updated: T0 + 3 * MS,
            },
        );
        assert_eq!(window.log(), &[T0 + MS, T0 + 3 * MS]);
    }

    #[test]
    fn test_echoed_local_entries_are_not_duplicated() {
        let mut window = SlidingWindow::configure(&config(10, 10), T0);
        window.check(T0 + MS);

        // A peer that merged our entry publishes it back along with its own.
        window.merge(
            "peer-b",
            SlidingWindowUpdate {
                request_logs: vec![T0 + MS, T0 + 2 * MS],
                last_updated: T0 + 2 * MS,
            },
        );
        assert_eq!(window.log(), &[T0 + MS, T0 + 2 * MS]);
    }

    #[test]
    fn test_ttl_and_expiry() {
        let window = SlidingWindow::configure(&config(3, 2), T0);
        assert_eq!(window.persist_ttl(), Duration::from_secs(6));
        assert_eq!(window.expiry_threshold(), Duration::from_secs(4));
        assert!(!window.is_expired(T0 + 4 * SEC));
        assert!(window.is_expired(T0 + 4 * SEC + 1));
    }

    #[test]
    fn test_configure_starts_empty() {
        let window = SlidingWindow::configure(&config(3, 2), T0);
        assert!(window.log().is_empty());
        assert_eq!(window.last_updated(), T0);
        assert_eq!(window.write_guard(), Some(("lastUpdated", T0)));
    }

    #[test]
    fn test_fields_restore_state() {
        let mut window = SlidingWindow::configure(&config(3, 2), T0);
        window.check(T0 + MS);
        window.check(T0 + 2 * MS);

        let fields = window.to_fields();
        assert_eq!(fields.get("windowSize").map(String::as_str), Some("2"));
        let restored = SlidingWindow::from_fields(&fields).unwrap();
        assert_eq!(restored, window);
    }

    #[test]
    fn test_from_fields_rejects_bad_log() {
        let mut fields = SlidingWindow::configure(&config(3, 2), T0).to_fields();
        fields.insert("requestLog".to_string(), "[1, \"x\"]".to_string());
        assert!(matches!(
            SlidingWindow::from_fields(&fields),
            Err(RateSyncError::Codec(_))
        ));
    }

    #[test]
    fn test_payload_validation() {
        let ok = SlidingWindowConfig::from_payload(&json!({"capacity": 3, "windowSize": 2}));
        assert_eq!(ok.unwrap(), config(3, 2));

        for (payload, field) in [
            (json!({"windowSize": 2}), "capacity"),
            (json!({"capacity": 3}), "windowSize"),
            (json!({"capacity": -3, "windowSize": 2}), "capacity"),
            (json!({"capacity": 3, "windowSize": 1.5}), "windowSize"),
            (json!(5), "configuration"),
        ] {
            match SlidingWindowConfig::from_payload(&payload) {
                Err(RateSyncError::InvalidConfiguration { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected invalid {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_window_above_limit_rejected() {
        let payload = json!({"capacity": 1, "windowSize": 10_000_000_000u64});
        match SlidingWindowConfig::from_payload(&payload) {
            Err(RateSyncError::InvalidConfiguration { field, .. }) => assert_eq!(field, "windowSize"),
            other => panic!("expected invalid windowSize, got {other:?}"),
        }

        let fields = Fields::from([
            ("capacity".to_string(), "1".to_string()),
            ("windowSize".to_string(), "10000000000".to_string()),
            ("lastUpdated".to_string(), "0".to_string()),
        ]);
        assert!(matches!(
            SlidingWindow::from_fields(&fields),
            Err(RateSyncError::Codec(_))
        ));
    }

    #[test]
    fn test_largest_window() {
        let payload = json!({"capacity": 1, "windowSize": MAX_WINDOW_SECS});
        let largest = SlidingWindowConfig::from_payload(&payload).unwrap();
        let mut window = SlidingWindow::configure(&largest, T0);

        assert!(window.check(T0).allowed);
        let denied = window.check(T0 + SEC);
        assert!(!denied.allowed);
        assert!(denied.reset_after > Duration::from_secs(MAX_WINDOW_SECS - 2));
        assert!(window.persist_ttl() > Duration::from_secs(2 * MAX_WINDOW_SECS));
        assert!(!window.is_expired(T0 + SEC));
    }

    #[test]
    fn test_out_of_range_window_saturates() {
        let huge = SlidingWindowConfig {
            capacity: 1,
            window_size: Duration::from_secs(10_000_000_000),
        };
        let mut window = SlidingWindow::configure(&huge, T0);

        assert!(window.check(T0).allowed);
        assert!(!window.check(T0 + SEC).allowed);
        assert_eq!(window.log(), &[T0]);
        assert!(!window.is_expired(T0 + SEC));
        assert_eq!(window.persist_ttl(), Duration::from_secs(20_000_000_002));
    }

    #[test]
    fn test_update_wire_format() {
        let update = SlidingWindowUpdate {
            request_logs: vec![1, 2],
            last_updated: 2,
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, json!({"requestLogs": [1, 2], "lastUpdated": 2}));
    }
}
