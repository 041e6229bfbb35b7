//! End-to-end checks against a live Redis on port 6380.
//!
//! Run with `cargo test -- --ignored` once a disposable Redis is up.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use sonic_rs::json;

use idle_session_store::config::SessionSettings;
use idle_session_store::kv::redis_store::RedisStore;
use idle_session_store::{Credential, EvictionHook, HookError, SessionRecord, SessionStore};

static REDIS_CLIENT: Lazy<redis::Client> = Lazy::new(|| {
    redis::Client::open("redis://127.0.0.1:6380/").unwrap()
});

async fn get_redis_conn() -> ConnectionManager {
    REDIS_CLIENT.get_connection_manager().await.unwrap()
}

#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl EvictionHook for RecordingHook {
    async fn revoke(
        &self,
        realm: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), HookError> {
        self.calls.lock().unwrap().push((
            realm.to_string(),
            access_token.to_string(),
            refresh_token.to_string(),
        ));
        Ok(())
    }
}

fn unique_sid() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("e2e_{}", nanos)
}

async fn setup(settings: SessionSettings) -> (Arc<RecordingHook>, Arc<SessionStore>) {
    let kv = RedisStore::new(REDIS_CLIENT.clone(), get_redis_conn().await);
    let hook = Arc::new(RecordingHook::default());
    let store = Arc::new(SessionStore::new(Arc::new(kv), hook.clone(), settings));
    store.init_pub().await.unwrap();
    (hook, store)
}

#[tokio::test]
#[ignore = "requires Redis on 127.0.0.1:6380"]
async fn test_set_get_destroy() {
    let (hook, store) = setup(SessionSettings::default()).await;
    let sid = unique_sid();
    let record = SessionRecord::with_credential(
        json!({"user": "e2e"}),
        Credential::new("tok1", "master", "ref1"),
    );

    store.set(&sid, &record).await.unwrap();
    assert_eq!(store.get(&sid).await.unwrap(), Some(record));

    let idle_ttl = store.idle_ttl(&sid).await.unwrap().unwrap();
    assert!(idle_ttl <= Duration::from_secs(120));

    store.restart_idle_ttl(&sid).await.unwrap();
    let idle_ttl = store.idle_ttl(&sid).await.unwrap().unwrap();
    assert!(idle_ttl > Duration::from_secs(120));

    store.destroy(&sid).await.unwrap();
    assert_eq!(store.get(&sid).await.unwrap(), None);
    assert_eq!(hook.calls.lock().unwrap().len(), 1);

    let mut con = get_redis_conn().await;
    let exists: i64 = redis::cmd("EXISTS")
        .arg(store.record_key(&sid))
        .arg(store.idle_key(&sid))
        .query_async(&mut con)
        .await
        .unwrap();
    assert_eq!(exists, 0);
}

#[tokio::test]
#[ignore = "requires Redis on 127.0.0.1:6380"]
async fn test_idle_expiry_triggers_revocation() {
    let settings = SessionSettings {
        idle_grace: Duration::from_secs(1),
        ..SessionSettings::default()
    };
    let (hook, store) = setup(settings).await;
    let listener = store.init_sub(0).await.unwrap();
    let sid = unique_sid();

    store
        .set(
            &sid,
            &SessionRecord::with_credential(json!({}), Credential::new("tok1", "master", "ref1")),
        )
        .await
        .unwrap();

    // Redis reports expirations from its active expiry cycle, which can lag.
    let mut revoked = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let called = !hook.calls.lock().unwrap().is_empty();
        if called && store.record_ttl(&sid).await.unwrap().is_none() {
            revoked = true;
            break;
        }
    }

    assert!(revoked, "eviction hook was not called");
    assert_eq!(store.get(&sid).await.unwrap(), None);
    assert_eq!(store.record_ttl(&sid).await.unwrap(), None);

    listener.shutdown().await;
}
