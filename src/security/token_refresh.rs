use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::security::credential_store::{CredentialStore, OAuthCredential};

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The identity endpoint refused the grant.
    #[error("token grant rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    /// The grant succeeded but carried no usable access token.
    #[error("token response did not contain an access_token")]
    MissingToken,
    /// The identity endpoint could not be reached in time.
    #[error("identity endpoint unreachable: {0}")]
    Transport(String),
}

/// Exchanges client credentials for a fresh access token.
#[async_trait]
pub trait TokenGrant: Send + Sync {
    async fn refresh(&self, client_id: &str, client_secret: &str) -> Result<String, RefreshError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Client-credentials refresher that writes the new token back to the
/// credential store before handing it out.
#[derive(Clone)]
pub struct TokenRefresher {
    http_client: Client,
    identity_url: String,
    scope: String,
    store: Arc<dyn CredentialStore>,
}

impl TokenRefresher {
    pub fn new(
        identity_url: impl Into<String>,
        scope: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;

        Ok(Self {
            http_client,
            identity_url: identity_url.into(),
            scope: scope.into(),
            store,
        })
    }

    async fn request_token(&self, client_id: &str, client_secret: &str) -> Result<String, RefreshError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("scope", self.scope.as_str()),
        ];

        debug!(url = %self.identity_url, client_id = %client_id, "requesting client-credentials grant");

        let response = self
            .http_client
            .post(&self.identity_url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        extract_access_token(&body)
    }
}

#[async_trait]
impl TokenGrant for TokenRefresher {
    async fn refresh(&self, client_id: &str, client_secret: &str) -> Result<String, RefreshError> {
        let token = self.request_token(client_id, client_secret).await?;

        let updated = OAuthCredential::new(client_id, client_secret).with_access_token(token.clone());
        match self.store.put_credential(&updated).await {
            Ok(()) => info!(client_id = %client_id, "refreshed access token persisted"),
            // The next invocation may reuse the stale token and refresh again.
            Err(err) => warn!(
                client_id = %client_id,
                error = %err,
                "failed to persist refreshed access token"
            ),
        }

        Ok(token)
    }
}

fn extract_access_token(body: &str) -> Result<String, RefreshError> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|_| RefreshError::MissingToken)?;
    parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or(RefreshError::MissingToken)
}
