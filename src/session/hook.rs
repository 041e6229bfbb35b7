use async_trait::async_trait;
use thiserror::Error;

/// Why a credential could not be revoked.
#[derive(Error, Debug)]
pub enum HookError {
    /// The revocation request could not be sent.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The upstream rejected the revocation.
    #[error("Revocation rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// Revokes upstream credentials before a session is deleted.
///
/// Implementations must succeed when the credential is already revoked: the
/// same session may be evicted by its owner and by the expiration listener.
#[async_trait]
pub trait EvictionHook: Send + Sync {
    async fn revoke(
        &self,
        realm: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), HookError>;
}
