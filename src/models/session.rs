use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An upstream credential that can be revoked when its session is evicted.
///
/// Fields that are missing from the stored JSON decode as empty strings; such a
/// credential is kept but never handed to the eviction hook.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    realm: String,
    #[serde(default)]
    refresh_token: String,
}

impl Credential {
    /// Creates a new `Credential`.
    pub fn new(
        access_token: impl Into<String>,
        realm: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            realm: realm.into(),
            refresh_token: refresh_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    /// Whether all three fields are present.
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.realm.is_empty() && !self.refresh_token.is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("realm", &self.realm)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// The data stored under a session's record key.
///
/// `payload` is opaque to the store. `credential`, when present and complete,
/// is revoked through the eviction hook before the session is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub payload: sonic_rs::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
}

impl SessionRecord {
    /// A record without a revocable credential.
    pub fn new(payload: sonic_rs::Value) -> Self {
        Self {
            payload,
            credential: None,
        }
    }

    /// A record carrying an upstream credential.
    pub fn with_credential(payload: sonic_rs::Value, credential: Credential) -> Self {
        Self {
            payload,
            credential: Some(credential),
        }
    }

    /// The credential to revoke on eviction, if the record holds a complete one.
    pub fn revocable(&self) -> Option<&Credential> {
        match &self.credential {
            Some(credential) if credential.is_complete() => Some(credential),
            _ => None,
        }
    }
}
