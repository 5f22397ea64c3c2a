//! Redis-backed store gateway.

use std::time::Duration;

use async_trait::async_trait;
use futures::{future, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::{Fields, StoreGateway, Subscription};
use crate::error::{RateSyncError, Result};

/// Store gateway talking to a Redis server.
///
/// Commands share one multiplexed connection; every subscription opens its own
/// pub/sub connection, which is closed when the subscription is dropped.
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` and verify the server answers.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RateSyncError::StoreUnavailable(format!("Failed to ping Redis server: {e}")))?;

        info!("Connected to Redis");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl StoreGateway for RedisStore {
    async fn get_hash(&self, key: &str) -> Result<Option<Fields>> {
        let mut conn = self.conn.clone();
        let fields: Fields = conn.hgetall(key).await?;
        // HGETALL answers an empty map for missing keys.
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn set_hash(&self, key: &str, fields: &Fields, ttl: Option<Duration>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(&String, &String)> = fields.iter().collect();

        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(key, &pairs).ignore();
        if let Some(ttl) = ttl {
            pipe.expire(key, ttl.as_secs().max(1) as i64).ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await?;
        debug!(key = %key, fields = fields.len(), ttl = ?ttl, "Stored hash");
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Subscribed to channel");

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| future::ready(msg.get_payload::<String>().ok()))
            .boxed())
    }
}
