//! Redis-backed session store with an absolute lifetime, a sliding idle
//! timeout, and credential revocation driven by expired-key notifications.

pub mod config;
pub mod error;
pub mod state;

pub mod kv {
    pub mod client;
    pub mod memory;
    pub mod redis_store;
}

pub mod models {
    pub mod session;
}

pub mod session {
    pub mod hook;
    pub mod listener;
    pub mod store;
}

pub mod revoke {
    pub mod keycloak;
}

pub use error::{Result, SessionError};
pub use models::session::{Credential, SessionRecord};
pub use session::hook::{EvictionHook, HookError};
pub use session::listener::ListenerHandle;
pub use session::store::SessionStore;
