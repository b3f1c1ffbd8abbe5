use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::security::credential_store::{CredentialStore, OAuthCredential, StoreError};

/// Vault KV response envelope: `{"data":{"data":{...}}}`.
#[derive(Debug, Deserialize)]
struct VaultKvResponse {
    #[serde(default)]
    data: VaultKvData,
}

#[derive(Debug, Deserialize, Default)]
struct VaultKvData {
    #[serde(default)]
    data: serde_json::Map<String, serde_json::Value>,
}

/// Connection settings for the Vault-backed credential store.
#[derive(Clone)]
pub struct VaultSettings {
    pub base_url: String,
    pub token: String,
    /// KV mount/prefix, e.g. `secret/data`.
    pub prefix: String,
}

impl std::fmt::Debug for VaultSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSettings")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Map a failed Vault status. A rejected Vault token will not fix itself.
fn status_error(action: &str, status: StatusCode, body: String) -> StoreError {
    let msg = format!("Vault {} failed with status {}: {}", action, status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Invalid(msg),
        _ => StoreError::Unavailable(msg),
    }
}

/// Credential store backed by a single Vault KV secret.
#[derive(Debug, Clone)]
pub struct VaultCredentialStore {
    settings: VaultSettings,
    secret_name: String,
    http_client: Client,
}

impl VaultCredentialStore {
    pub fn new(settings: VaultSettings, secret_name: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("creating HTTP client")?;

        debug!("Vault credential store initialized with base_url={}", settings.base_url);

        Ok(Self {
            settings,
            secret_name: secret_name.into(),
            http_client,
        })
    }

    /// Path: {base_url}/v1/{prefix}/{secret_name}
    fn secret_url(&self) -> String {
        format!(
            "{}/v1/{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.prefix.trim_matches('/'),
            self.secret_name
        )
    }
}

#[async_trait]
impl CredentialStore for VaultCredentialStore {
    async fn get_credential(&self) -> Result<OAuthCredential, StoreError> {
        let url = self.secret_url();
        debug!("Fetching OAuth secret from Vault: {}", url);

        let response = self
            .http_client
            .get(&url)
            .header("X-Vault-Token", &self.settings.token)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("sending Vault request: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::Invalid(format!(
                "secret {} not found in Vault",
                self.secret_name
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("fetch", status, body));
        }

        let vault_resp: VaultKvResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Invalid(format!("parsing Vault response: {e}")))?;

        let credential: OAuthCredential =
            serde_json::from_value(serde_json::Value::Object(vault_resp.data.data))
                .map_err(|e| StoreError::Invalid(format!("secret {}: {e}", self.secret_name)))?;

        if credential.client_id.is_empty() || credential.client_secret.is_empty() {
            return Err(StoreError::Invalid(format!(
                "secret {} has an empty client id or secret",
                self.secret_name
            )));
        }

        Ok(credential)
    }

    async fn put_credential(&self, credential: &OAuthCredential) -> Result<(), StoreError> {
        let url = self.secret_url();
        debug!("Storing OAuth secret in Vault: {}", url);

        let payload = serde_json::json!({ "data": credential });

        let response = self
            .http_client
            .post(&url)
            .header("X-Vault-Token", &self.settings.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("sending Vault store request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("store", status, body));
        }

        info!(secret = %self.secret_name, "OAuth secret updated in Vault");
        Ok(())
    }
}
