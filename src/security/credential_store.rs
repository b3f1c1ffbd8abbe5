use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// OAuth client credentials as persisted in the secret store.
///
/// The secret JSON uses the `PDOAuth*` key names on both read and write.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredential {
    #[serde(rename = "PDOAuthClientID")]
    pub client_id: String,
    #[serde(rename = "PDOAuthClientSecret")]
    pub client_secret: String,
    #[serde(
        rename = "PDOAuthAccessToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub access_token: Option<String>,
}

impl OAuthCredential {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Cached token, treating an empty string as absent.
    pub fn cached_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }
}

// Never print the secret or the token.
impl std::fmt::Debug for OAuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or answered with a server error.
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    /// The secret is missing or does not hold usable client credentials.
    #[error("secret is invalid: {0}")]
    Invalid(String),
}

/// Secret-store seam holding the OAuth credential for the incident service.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read a snapshot of the current credential.
    async fn get_credential(&self) -> Result<OAuthCredential, StoreError>;

    /// Replace the stored credential.
    async fn put_credential(&self, credential: &OAuthCredential) -> Result<(), StoreError>;
}

/// In-process credential store with snapshot reads.
#[derive(Debug, Clone)]
pub struct MemoryCredentialStore {
    credential: Arc<RwLock<Option<OAuthCredential>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryCredentialStore {
    pub fn new(credential: OAuthCredential) -> Self {
        Self {
            credential: Arc::new(RwLock::new(Some(credential))),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A store holding no secret at all.
    pub fn empty() -> Self {
        Self {
            credential: Arc::new(RwLock::new(None)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Current stored value, if any.
    pub async fn current(&self) -> Option<OAuthCredential> {
        self.credential.read().await.clone()
    }

    /// Number of successful `put_credential` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_credential(&self) -> Result<OAuthCredential, StoreError> {
        self.credential
            .read()
            .await
            .clone()
            .ok_or_else(|| StoreError::Invalid("no credential stored".to_string()))
    }

    async fn put_credential(&self, credential: &OAuthCredential) -> Result<(), StoreError> {
        let mut current = self.credential.write().await;
        *current = Some(credential.clone());
        drop(current);

        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(client_id = %credential.client_id, "credential replaced in memory store");
        Ok(())
    }
}
