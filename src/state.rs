use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::kv::redis_store::RedisStore;
use crate::revoke::keycloak::KeycloakRevoker;
use crate::session::store::SessionStore;

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The session store.
    pub sessions: Arc<SessionStore>,
    /// The application's configuration.
    pub config: Config,
}

impl AppState {
    /// Creates a new `AppState`.
    ///
    /// Connects to Redis and enables expired-key notifications. The expiration
    /// listener is started separately with `SessionStore::init_sub`.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let redis = RedisStore::connect(&config.redis_url).await?;

        let revoker = KeycloakRevoker::new(&config.keycloak);
        tracing::info!("✅ Keycloak revoker initialized ({})", config.keycloak.base_url);

        let sessions = Arc::new(SessionStore::new(
            Arc::new(redis),
            Arc::new(revoker),
            config.session.clone(),
        ));
        sessions.init_pub().await?;

        Ok(AppState {
            sessions,
            config: config.clone(),
        })
    }
}
