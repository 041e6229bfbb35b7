//! The key-value store contract the session store is built on.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// An expired-key notification as delivered by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredKey {
    /// The channel the notification arrived on.
    pub channel: String,
    /// The key whose TTL elapsed.
    pub key: String,
}

/// A single key written by [`KvStore::set_ex_atomic`].
#[derive(Debug, Clone, Copy)]
pub struct TtlEntry<'a> {
    pub key: &'a str,
    pub value: &'a str,
    pub ttl: Duration,
}

/// Returns the keyevent channel carrying expirations for `db_index`.
pub fn expired_channel(db_index: i64) -> String {
    format!("__keyevent@{}__:expired", db_index)
}

/// A key-value store with TTLs and expired-key notifications.
///
/// Commands run on one connection. `subscribe_expired` opens a separate
/// connection, since a subscribed connection cannot issue regular commands.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes every entry with its own TTL in a single transaction.
    async fn set_ex_atomic(&self, entries: &[TtlEntry<'_>]) -> Result<()>;

    /// Resets a key's TTL. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Deletes keys, returning how many existed.
    async fn del(&self, keys: &[&str]) -> Result<u64>;

    /// Remaining TTL of a key, or `None` if it is missing or has no TTL.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Turns on expired-key event notifications.
    async fn enable_expired_events(&self) -> Result<()>;

    /// Subscribes to expired-key events for `db_index`.
    async fn subscribe_expired(&self, db_index: i64) -> Result<BoxStream<'static, ExpiredKey>>;
}
