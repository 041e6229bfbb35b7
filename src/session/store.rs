//! Two-key session storage.
//!
//! Every session lives under two keys:
//! - the record (`<record_prefix><sid>`), written once with an absolute TTL;
//! - the idle marker (`<idle_prefix><sid>`), whose TTL slides with activity.
//!
//! A session is readable only while both exist. When the idle marker
//! expires, the expiration listener destroys the pair and revokes the
//! credential held in the record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::SessionSettings;
use crate::error::{Result, SessionError};
use crate::kv::client::{KvStore, TtlEntry};
use crate::models::session::SessionRecord;
use crate::session::hook::{EvictionHook, HookError};
use crate::session::listener::{ExpirationListener, ListenerHandle};

/// Value stored under idle markers. Only presence matters.
const IDLE_MARKER_VALUE: &str = "1";

/// What callers waiting on another `destroy` of the same session get back.
#[derive(Debug, Clone)]
enum SharedOutcome {
    Destroyed,
    RevocationFailed(String),
    Failed(String),
}

impl SharedOutcome {
    fn of(result: &Result<()>) -> Self {
        match result {
            Ok(()) => SharedOutcome::Destroyed,
            Err(SessionError::Eviction { source, .. }) => {
                SharedOutcome::RevocationFailed(source.to_string())
            }
            Err(e) => SharedOutcome::Failed(e.to_string()),
        }
    }

    fn into_result(self, sid: &str) -> Result<()> {
        match self {
            SharedOutcome::Destroyed => Ok(()),
            SharedOutcome::RevocationFailed(reason) => Err(SessionError::Eviction {
                sid: sid.to_string(),
                source: HookError::Other(reason),
            }),
            SharedOutcome::Failed(reason) => Err(SessionError::Internal(format!(
                "concurrent destroy of {} failed: {}",
                sid, reason
            ))),
        }
    }
}

type OutcomeReceiver = watch::Receiver<Option<SharedOutcome>>;

/// Session ids with a `destroy` in progress.
#[derive(Default)]
struct InFlight(Mutex<HashMap<String, OutcomeReceiver>>);

enum Claim<'a> {
    /// This call performs the destroy.
    Owner(InFlightGuard<'a>),
    /// Another call is already destroying the session.
    Waiter(OutcomeReceiver),
}

impl InFlight {
    fn claim(&self, sid: &str) -> Claim<'_> {
        let mut map = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(rx) = map.get(sid) {
            return Claim::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        map.insert(sid.to_string(), rx);
        Claim::Owner(InFlightGuard {
            set: self,
            sid: sid.to_string(),
            tx,
        })
    }
}

struct InFlightGuard<'a> {
    set: &'a InFlight,
    sid: String,
    tx: watch::Sender<Option<SharedOutcome>>,
}

impl InFlightGuard<'_> {
    /// Hands the outcome to every waiter, then releases the claim.
    fn complete(self, result: &Result<()>) {
        self.tx.send_replace(Some(SharedOutcome::of(result)));
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.set.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(&self.sid);
    }
}

/// Session store enforcing an absolute lifetime and a sliding idle timeout.
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    hook: Arc<dyn EvictionHook>,
    settings: SessionSettings,
    in_flight: InFlight,
}

impl SessionStore {
    /// Creates a new `SessionStore`.
    ///
    /// # Arguments
    ///
    /// * `kv` - The backing key-value store.
    /// * `hook` - Revokes credentials before a session is deleted.
    /// * `settings` - TTLs and key prefixes.
    pub fn new(
        kv: Arc<dyn KvStore>,
        hook: Arc<dyn EvictionHook>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            kv,
            hook,
            settings,
            in_flight: InFlight::default(),
        }
    }

    /// Key holding the session's record.
    pub fn record_key(&self, sid: &str) -> String {
        format!("{}{}", self.settings.record_prefix, sid)
    }

    /// Key holding the session's idle marker.
    pub fn idle_key(&self, sid: &str) -> String {
        format!("{}{}", self.settings.idle_prefix, sid)
    }

    /// Extracts the session id from an idle marker key.
    ///
    /// Returns `None` for any other key, record keys included.
    pub fn sid_from_idle_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.settings.idle_prefix.as_str())
            .filter(|sid| !sid.is_empty())
    }

    /// Enables expired-key notifications on the store.
    pub async fn init_pub(&self) -> Result<()> {
        self.kv.enable_expired_events().await.map_err(|e| {
            tracing::error!("❌ Failed to enable expired-key notifications: {}", e);
            SessionError::Configuration(format!("enabling expired-key notifications: {}", e))
        })?;
        tracing::info!("✅ Expired-key notifications enabled");
        Ok(())
    }

    /// Subscribes to expired-key events of `db_index` and starts the listener
    /// that destroys sessions whose idle marker expired.
    pub async fn init_sub(self: &Arc<Self>, db_index: i64) -> Result<ListenerHandle> {
        let events = self.kv.subscribe_expired(db_index).await.map_err(|e| {
            tracing::error!(db_index, "❌ Failed to subscribe to expired-key events: {}", e);
            SessionError::Configuration(format!(
                "subscribing to expired-key events of db {}: {}",
                db_index, e
            ))
        })?;
        tracing::info!(db_index, "✅ Expiration listener subscribed");
        Ok(ExpirationListener::spawn(Arc::clone(self), events))
    }

    /// Reads a session.
    ///
    /// Returns `None` when the idle marker is gone, even if the record has not
    /// expired yet.
    pub async fn get(&self, sid: &str) -> Result<Option<SessionRecord>> {
        let idle_key = self.idle_key(sid);
        if self.kv.get(&idle_key).await?.is_none() {
            tracing::debug!(sid, "🔍 Session idle or unknown");
            return Ok(None);
        }
        self.load_record(sid).await
    }

    /// Reads and decodes the record regardless of the idle marker.
    async fn load_record(&self, sid: &str) -> Result<Option<SessionRecord>> {
        let record_key = self.record_key(sid);
        let Some(raw) = self.kv.get(&record_key).await? else {
            tracing::debug!(sid, "🔍 No record stored");
            return Ok(None);
        };

        let record: SessionRecord = sonic_rs::from_str(&raw).map_err(|e| {
            tracing::error!(sid, key = %record_key, "❌ Invalid session JSON: {}", e);
            SessionError::Decode(format!("{}: {}", record_key, e))
        })?;
        Ok(Some(record))
    }

    /// Writes a session, starting its absolute lifetime and its idle grace
    /// period.
    ///
    /// Both keys are written in one transaction.
    pub async fn set(&self, sid: &str, record: &SessionRecord) -> Result<()> {
        let session_json = sonic_rs::to_string(record)
            .map_err(|e| SessionError::Encode(format!("Session serialization failed: {}", e)))?;

        let record_key = self.record_key(sid);
        let idle_key = self.idle_key(sid);
        self.kv
            .set_ex_atomic(&[
                TtlEntry {
                    key: &record_key,
                    value: &session_json,
                    ttl: self.settings.max_age,
                },
                TtlEntry {
                    key: &idle_key,
                    value: IDLE_MARKER_VALUE,
                    ttl: self.settings.idle_grace,
                },
            ])
            .await
            .map_err(|e| {
                tracing::error!(sid, "❌ Failed to save session: {}", e);
                e
            })?;

        tracing::debug!(sid, "✅ Session saved");
        Ok(())
    }

    /// Resets the idle marker's TTL to the steady-state idle timeout.
    ///
    /// The record's TTL is left alone. A missing marker is not an error.
    pub async fn restart_idle_ttl(&self, sid: &str) -> Result<()> {
        let idle_key = self.idle_key(sid);
        if !self.kv.expire(&idle_key, self.settings.max_idle).await? {
            tracing::debug!(sid, "🔍 No idle marker to refresh");
        }
        Ok(())
    }

    /// Destroys a session, revoking its credential first.
    ///
    /// Both keys are deleted even when revocation fails; the revocation error
    /// is returned afterwards. A call that arrives while another `destroy` of
    /// the same `sid` is running waits for it and returns its outcome, so the
    /// hook runs once and the keys are gone whenever `Ok` is returned.
    pub async fn destroy(&self, sid: &str) -> Result<()> {
        loop {
            match self.in_flight.claim(sid) {
                Claim::Owner(guard) => {
                    let result = self.destroy_now(sid).await;
                    guard.complete(&result);
                    return result;
                }
                Claim::Waiter(mut rx) => {
                    tracing::info!(sid, "⏳ Destroy already in progress, waiting for it");
                    let waited = rx.wait_for(Option::is_some).await.map(|o| o.clone());
                    match waited {
                        Ok(outcome) => {
                            let outcome = outcome.unwrap_or(SharedOutcome::Destroyed);
                            return outcome.into_result(sid);
                        }
                        // The owner was dropped before finishing; take over.
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    async fn destroy_now(&self, sid: &str) -> Result<()> {
        let outcome = match self.load_record(sid).await {
            Ok(Some(record)) => self.revoke(sid, &record).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        let record_key = self.record_key(sid);
        let idle_key = self.idle_key(sid);
        self.kv
            .del(&[record_key.as_str(), idle_key.as_str()])
            .await
            .map_err(|e| {
                tracing::error!(sid, "❌ Failed to delete session keys: {}", e);
                e
            })?;

        tracing::info!(sid, "🗑️ Session destroyed");
        outcome
    }

    async fn revoke(&self, sid: &str, record: &SessionRecord) -> Result<()> {
        let Some(credential) = record.revocable() else {
            return Ok(());
        };

        self.hook
            .revoke(
                credential.realm(),
                credential.access_token(),
                credential.refresh_token(),
            )
            .await
            .map_err(|source| SessionError::Eviction {
                sid: sid.to_string(),
                source,
            })?;

        tracing::info!(sid, realm = credential.realm(), "🔒 Credential revoked");
        Ok(())
    }

    /// Remaining TTL of the idle marker.
    pub async fn idle_ttl(&self, sid: &str) -> Result<Option<Duration>> {
        self.kv.ttl(&self.idle_key(sid)).await
    }

    /// Remaining TTL of the record.
    pub async fn record_ttl(&self, sid: &str) -> Result<Option<Duration>> {
        self.kv.ttl(&self.record_key(sid)).await
    }
}
