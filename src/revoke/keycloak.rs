use async_trait::async_trait;
use reqwest::StatusCode;
use zeroize::Zeroizing;

use crate::config::KeycloakConfig;
use crate::session::hook::{EvictionHook, HookError};

/// Revokes sessions through Keycloak's OpenID Connect logout endpoint.
///
/// Posting the refresh token ends the upstream SSO session, which invalidates
/// both tokens. A token Keycloak no longer knows (`invalid_grant`) counts as
/// revoked.
#[derive(Clone)]
pub struct KeycloakRevoker {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: Option<Zeroizing<String>>,
}

impl KeycloakRevoker {
    /// Creates a new `KeycloakRevoker`.
    pub fn new(config: &KeycloakConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Creates a `KeycloakRevoker` sharing an existing HTTP client.
    pub fn with_client(http: reqwest::Client, config: &KeycloakConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    /// The logout endpoint of `realm`.
    pub fn logout_url(&self, realm: &str) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/logout",
            self.base_url, realm
        )
    }
}

/// Whether a rejected logout means the token was already gone.
fn is_already_revoked(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST && body.contains("invalid_grant")
}

#[async_trait]
impl EvictionHook for KeycloakRevoker {
    async fn revoke(
        &self,
        realm: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), HookError> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http
            .post(self.logout_url(realm))
            .bearer_auth(access_token)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(realm, "✅ Keycloak session logged out");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if is_already_revoked(status, &body) {
            tracing::debug!(realm, "🔒 Keycloak session already revoked");
            return Ok(());
        }

        tracing::warn!(realm, status = status.as_u16(), "❌ Keycloak logout rejected");
        Err(HookError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
