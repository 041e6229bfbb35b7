//! An in-process [`KvStore`] with Redis-like expiry semantics.
//!
//! TTLs run on the tokio clock, so tests can drive them with
//! `tokio::time::pause` and `advance`. Expired keys are removed lazily on
//! access or eagerly by [`MemoryStore::purge_expired`]; either way an expired
//! event is published once notifications have been enabled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{Result, SessionError};
use crate::kv::client::{ExpiredKey, KvStore, TtlEntry, expired_channel};

const EVENT_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    notify_expired: bool,
}

/// An in-memory key-value store holding a single database.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ExpiredKey>,
    db_index: i64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryStore {
    /// Creates an empty store acting as database `db_index`.
    pub fn new(db_index: i64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
            db_index,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Removes the key if its TTL has elapsed, returning the event to publish.
    fn evict_if_expired(&self, inner: &mut Inner, key: &str, now: Instant) -> Option<ExpiredKey> {
        let expired = inner.entries.get(key).is_some_and(|e| e.is_expired(now));
        if !expired {
            return None;
        }
        inner.entries.remove(key);
        inner.notify_expired.then(|| self.event_for(key))
    }

    fn event_for(&self, key: &str) -> ExpiredKey {
        ExpiredKey {
            channel: expired_channel(self.db_index),
            key: key.to_string(),
        }
    }

    fn publish(&self, events: impl IntoIterator<Item = ExpiredKey>) {
        for event in events {
            tracing::trace!(key = %event.key, "⌛ Key expired");
            // No subscribers is not an error.
            let _ = self.events.send(event);
        }
    }

    /// Removes every key whose TTL has elapsed and publishes their events.
    ///
    /// Returns the number of keys removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed;
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            let due: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &due {
                inner.entries.remove(key);
                if inner.notify_expired {
                    events.push(self.event_for(key));
                }
            }
            removed = due.len();
        }
        self.publish(events);
        removed
    }

    /// Publishes an expired event for `key` without touching stored data.
    pub fn publish_expired(&self, key: &str) {
        self.publish([self.event_for(key)]);
    }

    /// Whether `key` is currently stored and live.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Writes `key` with no TTL.
    pub fn insert(&self, key: &str, value: &str) {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let (value, event) = {
            let mut inner = self.lock();
            let event = self.evict_if_expired(&mut inner, key, now);
            (inner.entries.get(key).map(|e| e.value.clone()), event)
        };
        self.publish(event);
        Ok(value)
    }

    async fn set_ex_atomic(&self, entries: &[TtlEntry<'_>]) -> Result<()> {
        if let Some(entry) = entries.iter().find(|e| e.ttl.as_secs() == 0) {
            return Err(SessionError::Internal(format!(
                "invalid expire time for {}",
                entry.key
            )));
        }

        let now = Instant::now();
        let mut inner = self.lock();
        for entry in entries {
            inner.entries.insert(
                entry.key.to_string(),
                Entry {
                    value: entry.value.to_string(),
                    expires_at: Some(now + entry.ttl),
                },
            );
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let (updated, event) = {
            let mut inner = self.lock();
            let event = self.evict_if_expired(&mut inner, key, now);
            let updated = match inner.entries.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(now + ttl);
                    true
                }
                None => false,
            };
            (updated, event)
        };
        self.publish(event);
        Ok(updated)
    }

    async fn del(&self, keys: &[&str]) -> Result<u64> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut removed = 0;
        {
            let mut inner = self.lock();
            for key in keys {
                events.extend(self.evict_if_expired(&mut inner, key, now));
                if inner.entries.remove(*key).is_some() {
                    removed += 1;
                }
            }
        }
        self.publish(events);
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let (ttl, event) = {
            let mut inner = self.lock();
            let event = self.evict_if_expired(&mut inner, key, now);
            let ttl = inner
                .entries
                .get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now));
            (ttl, event)
        };
        self.publish(event);
        Ok(ttl)
    }

    async fn enable_expired_events(&self) -> Result<()> {
        self.lock().notify_expired = true;
        Ok(())
    }

    async fn subscribe_expired(&self, db_index: i64) -> Result<BoxStream<'static, ExpiredKey>> {
        if db_index != self.db_index {
            return Err(SessionError::Configuration(format!(
                "memory store holds database {}, not {}",
                self.db_index, db_index
            )));
        }

        let receiver = self.events.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("⚠️ Expired event subscriber lagged, {} events lost", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
