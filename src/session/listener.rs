//! Background destruction of idle sessions.
//!
//! Two tasks cooperate: a reader drains the store's expired-key stream into a
//! bounded queue, and a dispatcher spawns a `destroy` for every idle marker
//! that shows up on it. A failing `destroy` is logged and dropped so that one
//! bad session never stalls the others. Spawned destroys are tracked and
//! awaited on shutdown.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::kv::client::ExpiredKey;
use crate::session::store::SessionStore;

/// Capacity of the queue between the reader and the dispatcher.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Spawns and owns the listener tasks.
pub struct ExpirationListener;

impl ExpirationListener {
    /// Starts consuming `events` on behalf of `store`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<SessionStore>, events: BoxStream<'static, ExpiredKey>) -> ListenerHandle {
        let cancel = CancellationToken::new();
        let destroys = TaskTracker::new();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let reader = tokio::spawn(read_events(events, tx, cancel.clone()));
        let dispatcher = tokio::spawn(dispatch_events(store, rx, destroys.clone()));

        ListenerHandle {
            cancel,
            reader,
            dispatcher,
            destroys,
        }
    }
}

/// Handle to a running expiration listener.
pub struct ListenerHandle {
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    destroys: TaskTracker,
}

impl ListenerHandle {
    /// Token that stops the listener when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether both tasks have exited.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.dispatcher.is_finished()
    }

    /// Stops reading new events, lets already queued ones dispatch, and waits
    /// for both tasks and every destroy they started.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.reader.await {
            tracing::error!("❌ Expiration reader task failed: {}", e);
        }
        if let Err(e) = self.dispatcher.await {
            tracing::error!("❌ Expiration dispatcher task failed: {}", e);
        }

        self.destroys.close();
        if !self.destroys.is_empty() {
            tracing::info!(pending = self.destroys.len(), "⏳ Waiting for in-flight destroys");
        }
        self.destroys.wait().await;
        tracing::info!("👋 Expiration listener stopped");
    }
}

async fn read_events(
    mut events: BoxStream<'static, ExpiredKey>,
    tx: mpsc::Sender<ExpiredKey>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => match next {
                Some(event) => event,
                None => {
                    tracing::warn!("⚠️ Expired-key stream ended");
                    break;
                }
            },
        };

        if tx.send(event).await.is_err() {
            tracing::warn!("⚠️ Expiration dispatcher gone, stopping reader");
            break;
        }
    }
}

async fn dispatch_events(
    store: Arc<SessionStore>,
    mut rx: mpsc::Receiver<ExpiredKey>,
    destroys: TaskTracker,
) {
    while let Some(event) = rx.recv().await {
        dispatch(&store, &destroys, event);
    }
}

fn dispatch(store: &Arc<SessionStore>, destroys: &TaskTracker, event: ExpiredKey) {
    let Some(sid) = store.sid_from_idle_key(&event.key) else {
        tracing::trace!(key = %event.key, channel = %event.channel, "Ignoring expired key");
        return;
    };

    tracing::debug!(sid, "⌛ Idle marker expired");
    let sid = sid.to_string();
    let store = Arc::clone(store);
    destroys.spawn(async move {
        if let Err(e) = store.destroy(&sid).await {
            tracing::error!(sid = %sid, key = %event.key, "❌ Automatic destroy failed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::kv::client::KvStore;
    use crate::kv::memory::MemoryStore;
    use crate::models::session::SessionRecord;
    use crate::session::hook::{EvictionHook, HookError};
    use async_trait::async_trait;
    use sonic_rs::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct NoopHook;

    #[async_trait]
    impl EvictionHook for NoopHook {
        async fn revoke(&self, _: &str, _: &str, _: &str) -> Result<(), HookError> {
            Ok(())
        }
    }

    /// Blocks every revocation until the gate is opened.
    struct GatedHook {
        entered: Notify,
        gate: Notify,
        finished: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl EvictionHook for GatedHook {
        async fn revoke(&self, _: &str, _: &str, _: &str) -> Result<(), HookError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.finished.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn setup() -> (MemoryStore, Arc<SessionStore>) {
        let kv = MemoryStore::default();
        let store = Arc::new(SessionStore::new(
            Arc::new(kv.clone()),
            Arc::new(NoopHook),
            SessionSettings::default(),
        ));
        (kv, store)
    }

    #[tokio::test]
    async fn idle_marker_event_destroys_the_session() {
        let (kv, store) = setup();
        store.set("u1", &SessionRecord::new(json!({"n": 1}))).await.unwrap();
        let listener = store.init_sub(0).await.unwrap();

        kv.del(&["session-idle:u1"]).await.unwrap();
        kv.publish_expired("session-idle:u1");
        settle().await;

        assert!(!kv.contains("session:u1"));
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn record_key_event_is_ignored() {
        let (kv, store) = setup();
        store.set("u1", &SessionRecord::new(json!({"n": 1}))).await.unwrap();
        let listener = store.init_sub(0).await.unwrap();

        kv.publish_expired("session:u1");
        settle().await;

        assert!(kv.contains("session:u1"));
        assert!(kv.contains("session-idle:u1"));
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn failed_destroy_does_not_stop_the_listener() {
        let (kv, store) = setup();
        kv.insert("session:bad", "{not json");
        store.set("good", &SessionRecord::new(json!({}))).await.unwrap();
        let listener = store.init_sub(0).await.unwrap();

        kv.publish_expired("session-idle:bad");
        settle().await;
        assert!(!kv.contains("session:bad"));

        kv.publish_expired("session-idle:good");
        settle().await;
        assert!(!kv.contains("session:good"));

        assert!(!listener.is_finished());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_both_tasks() {
        let (kv, store) = setup();
        let listener = store.init_sub(0).await.unwrap();
        let token = listener.cancellation_token();

        tokio::time::timeout(Duration::from_secs(1), listener.shutdown())
            .await
            .unwrap();
        assert!(token.is_cancelled());

        // No subscriber left; publishing must not panic.
        kv.publish_expired("session-idle:u1");
        assert_eq!(kv.del(&["session-idle:u1"]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_destroys() {
        let kv = MemoryStore::default();
        let hook = Arc::new(GatedHook {
            entered: Notify::new(),
            gate: Notify::new(),
            finished: Default::default(),
        });
        let store = Arc::new(SessionStore::new(
            Arc::new(kv.clone()),
            hook.clone(),
            SessionSettings::default(),
        ));
        let record = SessionRecord::with_credential(
            json!({}),
            crate::models::session::Credential::new("tok1", "master", "ref1"),
        );
        store.set("u1", &record).await.unwrap();
        let listener = store.init_sub(0).await.unwrap();

        kv.publish_expired("session-idle:u1");
        tokio::time::timeout(Duration::from_secs(1), hook.entered.notified())
            .await
            .unwrap();

        let shutdown = tokio::spawn(listener.shutdown());
        settle().await;
        assert!(!shutdown.is_finished());
        assert!(kv.contains("session:u1"));

        hook.gate.notify_one();
        tokio::time::timeout(Duration::from_secs(1), shutdown)
            .await
            .unwrap()
            .unwrap();

        assert!(hook.finished.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!kv.contains("session:u1"));
        assert!(!kv.contains("session-idle:u1"));
    }
}
