use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::{Result, SessionError};
use crate::kv::client::{ExpiredKey, KvStore, TtlEntry, expired_channel};

/// A [`KvStore`] backed by Redis.
///
/// Commands go through a pooled `ConnectionManager`; each subscription gets
/// its own pub/sub connection from `client`.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    redis: ConnectionManager,
}

impl RedisStore {
    /// Opens the command connection.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - The URL of the Redis server.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `RedisStore`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client.clone()).await?;
        tracing::info!("✅ Redis Connection Manager initialized (pooled)");
        Ok(Self { client, redis })
    }

    /// Wraps an existing client and connection manager.
    pub fn new(client: redis::Client, redis: ConnectionManager) -> Self {
        Self { client, redis }
    }
}

/// `EXPIRE` takes a signed second count.
fn ttl_secs(ttl: Duration) -> Result<i64> {
    i64::try_from(ttl.as_secs())
        .map_err(|_| SessionError::Internal(format!("TTL of {}s is out of range", ttl.as_secs())))
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.redis.clone().get(key).await?;
        Ok(value)
    }

    async fn set_ex_atomic(&self, entries: &[TtlEntry<'_>]) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in entries {
            pipe.set_ex(entry.key, entry.value, entry.ttl.as_secs()).ignore();
        }

        let _: () = pipe.query_async(&mut self.redis.clone()).await.map_err(|e| {
            tracing::error!("❌ Redis MULTI/EXEC failed: {}", e);
            e
        })?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated: bool = self.redis.clone().expire(key, ttl_secs(ttl)?).await?;
        Ok(updated)
    }

    async fn del(&self, keys: &[&str]) -> Result<u64> {
        let removed: u64 = self.redis.clone().del(keys).await?;
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        // -2: missing, -1: no expiry
        let secs: i64 = self.redis.clone().ttl(key).await?;
        Ok(u64::try_from(secs).ok().map(Duration::from_secs))
    }

    async fn enable_expired_events(&self) -> Result<()> {
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    async fn subscribe_expired(&self, db_index: i64) -> Result<BoxStream<'static, ExpiredKey>> {
        let channel = expired_channel(db_index);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        tracing::info!("📡 Subscribed to {}", channel);

        let events = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(key) => Some(ExpiredKey {
                    channel: msg.get_channel_name().to_string(),
                    key,
                }),
                Err(e) => {
                    tracing::warn!("⚠️ Dropping expired event with unreadable payload: {}", e);
                    None
                }
            }
        });

        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_secs_accepts_normal_durations() {
        assert_eq!(ttl_secs(Duration::from_secs(1_800)).unwrap(), 1_800);
        assert_eq!(ttl_secs(Duration::from_millis(1_500)).unwrap(), 1);
    }

    #[test]
    fn ttl_secs_rejects_out_of_range_durations() {
        assert!(matches!(
            ttl_secs(Duration::from_secs(u64::MAX)),
            Err(SessionError::Internal(_))
        ));
    }
}
