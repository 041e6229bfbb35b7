use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use zeroize::Zeroizing;

/// Default absolute session lifetime in seconds.
pub const DEFAULT_MAX_AGE_SECS: u64 = 86_400;
/// Default sliding idle timeout in seconds.
pub const DEFAULT_MAX_IDLE_SECS: u64 = 1_800;
/// Default idle window granted to a freshly written session, in seconds.
pub const DEFAULT_IDLE_GRACE_SECS: u64 = 120;
/// Default prefix of session record keys.
pub const DEFAULT_RECORD_PREFIX: &str = "session:";
/// Default prefix of idle marker keys.
pub const DEFAULT_IDLE_PREFIX: &str = "session-idle:";

/// TTLs and key layout used by the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Absolute lifetime of a record. Never extended.
    pub max_age: Duration,
    /// Idle timeout applied on every `restart_idle_ttl`.
    pub max_idle: Duration,
    /// Idle timeout applied by `set`.
    pub idle_grace: Duration,
    /// Prefix of record keys.
    pub record_prefix: String,
    /// Prefix of idle marker keys.
    pub idle_prefix: String,
    /// Database whose expired-key events are consumed.
    pub db_index: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            max_idle: Duration::from_secs(DEFAULT_MAX_IDLE_SECS),
            idle_grace: Duration::from_secs(DEFAULT_IDLE_GRACE_SECS),
            record_prefix: DEFAULT_RECORD_PREFIX.to_string(),
            idle_prefix: DEFAULT_IDLE_PREFIX.to_string(),
            db_index: 0,
        }
    }
}

impl SessionSettings {
    /// Checks that the settings describe a usable key layout.
    ///
    /// Both prefixes must be non-empty and neither may be a prefix of the other,
    /// otherwise record keys could be mistaken for idle markers by the listener.
    pub fn validate(&self) -> Result<()> {
        if self.record_prefix.is_empty() || self.idle_prefix.is_empty() {
            anyhow::bail!("Session key prefixes must not be empty");
        }
        if self.record_prefix.starts_with(&self.idle_prefix)
            || self.idle_prefix.starts_with(&self.record_prefix)
        {
            anyhow::bail!(
                "Session key prefixes overlap: {:?} / {:?}",
                self.record_prefix,
                self.idle_prefix
            );
        }
        for (name, ttl) in [
            ("max_age", self.max_age),
            ("max_idle", self.max_idle),
            ("idle_grace", self.idle_grace),
        ] {
            if ttl.as_secs() == 0 {
                anyhow::bail!("{} must be at least one second", name);
            }
        }
        if self.db_index < 0 {
            anyhow::bail!("db_index must not be negative");
        }
        Ok(())
    }
}

/// Settings for the Keycloak revocation hook.
#[derive(Clone)]
pub struct KeycloakConfig {
    /// Base URL of the Keycloak server, without a trailing `/realms`.
    pub base_url: String,
    /// The client the sessions' tokens were issued to.
    pub client_id: String,
    /// The client secret, for confidential clients.
    pub client_secret: Option<Zeroizing<String>>,
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the Redis server.
    pub redis_url: String,
    /// Session TTLs and key layout.
    pub session: SessionSettings,
    /// The revocation endpoint settings.
    pub keycloak: KeycloakConfig,
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let session = SessionSettings {
            max_age: Duration::from_secs(env_or("SESSION_MAX_AGE_SECS", DEFAULT_MAX_AGE_SECS)?),
            max_idle: Duration::from_secs(env_or("SESSION_MAX_IDLE_SECS", DEFAULT_MAX_IDLE_SECS)?),
            idle_grace: Duration::from_secs(env_or(
                "SESSION_IDLE_GRACE_SECS",
                DEFAULT_IDLE_GRACE_SECS,
            )?),
            record_prefix: env::var("SESSION_RECORD_PREFIX")
                .unwrap_or_else(|_| DEFAULT_RECORD_PREFIX.to_string()),
            idle_prefix: env::var("SESSION_IDLE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_IDLE_PREFIX.to_string()),
            db_index: env_or("REDIS_DB", 0)?,
        };
        session.validate()?;

        let keycloak = KeycloakConfig {
            base_url: env::var("KEYCLOAK_URL").context("KEYCLOAK_URL must be set")?,
            client_id: env::var("KEYCLOAK_CLIENT_ID").unwrap_or_else(|_| "account".to_string()),
            client_secret: env::var("KEYCLOAK_CLIENT_SECRET").ok().map(Zeroizing::new),
        };

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            session,
            keycloak,
        })
    }
}
