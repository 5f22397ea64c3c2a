//! Durable storage and publish/subscribe gateway.
//!
//! The limiter core only ever talks to storage through [`StoreGateway`]: hashes
//! with an optional TTL for persisted state and configuration, and named
//! channels for cross-instance state updates.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Field name to value mapping of a stored hash.
pub type Fields = HashMap<String, String>;

/// A live channel subscription. Dropping it closes the subscription.
pub type Subscription = BoxStream<'static, String>;

/// Contract consumed by the limiter core.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Read every field of a hash. Returns `None` when the key does not exist.
    async fn get_hash(&self, key: &str) -> Result<Option<Fields>>;

    /// Merge `fields` into the hash at `key`, refreshing its TTL when one is given.
    async fn set_hash(&self, key: &str, fields: &Fields, ttl: Option<Duration>) -> Result<()>;

    /// Read a single field of a hash.
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Broadcast a payload to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
