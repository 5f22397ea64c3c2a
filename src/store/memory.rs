//! In-process store gateway.
//!
//! Backs single-node deployments and tests. Several limiter managers sharing
//! one `MemoryStore` behave like several instances sharing one Redis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{future, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use super::{Fields, StoreGateway, Subscription};
use crate::error::{RateSyncError, Result};

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

struct StoredHash {
    fields: Fields,
    expires_at: Option<Instant>,
}

impl StoredHash {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-memory hash storage with TTLs and broadcast channels.
pub struct MemoryStore {
    hashes: RwLock<HashMap<String, StoredHash>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            hashes: RwLock::new(HashMap::new()),
            channels: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`RateSyncError::StoreUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining time to live of a hash, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let hashes = self.hashes.read();
        hashes
            .get(key)
            .filter(|h| h.is_live(now))
            .and_then(|h| h.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RateSyncError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn get_hash(&self, key: &str) -> Result<Option<Fields>> {
        self.ensure_available()?;
        let now = Instant::now();
        let hashes = self.hashes.read();
        Ok(hashes
            .get(key)
            .filter(|h| h.is_live(now) && !h.fields.is_empty())
            .map(|h| h.fields.clone()))
    }

    async fn set_hash(&self, key: &str, fields: &Fields, ttl: Option<Duration>) -> Result<()> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut hashes = self.hashes.write();
        let entry = hashes.entry(key.to_string()).or_insert_with(|| StoredHash {
            fields: Fields::new(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.fields.clear();
            entry.expires_at = None;
        }
        entry
            .fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let now = Instant::now();
        let hashes = self.hashes.read();
        Ok(hashes
            .get(key)
            .filter(|h| h.is_live(now))
            .and_then(|h| h.fields.get(field).cloned()))
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.ensure_available()?;
        // A send error only means nobody is subscribed right now.
        let receivers = self.sender(channel).send(payload).unwrap_or(0);
        trace!(channel = %channel, receivers, "Published update");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.ensure_available()?;
        let receiver = self.sender(channel).subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(|msg| future::ready(msg.ok()))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_set_and_get_hash() {
        let store = MemoryStore::new();
        store
            .set_hash("h", &fields(&[("a", "1"), ("b", "2")]), None)
            .await
            .unwrap();

        let hash = store.get_hash("h").await.unwrap().unwrap();
        assert_eq!(hash.get("a").map(String::as_str), Some("1"));
        assert_eq!(store.get_field("h", "b").await.unwrap().as_deref(), Some("2"));
        assert!(store.get_field("h", "c").await.unwrap().is_none());
        assert!(store.get_hash("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_hash_merges_fields() {
        let store = MemoryStore::new();
        store.set_hash("h", &fields(&[("a", "1")]), None).await.unwrap();
        store.set_hash("h", &fields(&[("b", "2")]), None).await.unwrap();

        let hash = store.get_hash("h").await.unwrap().unwrap();
        assert_eq!(hash.len(), 2);
    }

    #[tokio::test]
    async fn test_hash_expires_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_hash("h", &fields(&[("a", "1")]), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(store.ttl("h").is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get_hash("h").await.unwrap().is_none());
        assert!(store.get_field("h", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("chan").await.unwrap();
        let mut second = store.subscribe("chan").await.unwrap();

        store.publish("chan", "hello".to_string()).await.unwrap();

        assert_eq!(first.next().await.as_deref(), Some("hello"));
        assert_eq!(second.next().await.as_deref(), Some("hello"));
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let store = MemoryStore::new();
        assert!(tokio_test::block_on(store.publish("nobody", "x".to_string())).is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(
            store.get_hash("h").await,
            Err(RateSyncError::StoreUnavailable(_))
        ));
        assert!(store.publish("c", String::new()).await.is_err());
        assert!(store.subscribe("c").await.is_err());

        store.set_available(true);
        assert!(store.get_hash("h").await.is_ok());
    }
}
