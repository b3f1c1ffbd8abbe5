use thiserror::Error;

use crate::security::credential_store::StoreError;
use crate::security::token_refresh::RefreshError;

/// Terminal failure of a single relay invocation.
///
/// The variant decides whether the queue should redeliver the message,
/// see [`RelayError::is_retryable`].
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("incident rejected {}: {details}", describe_status(.status))]
    ClientError { status: Option<u16>, details: String },

    #[error("incident service unavailable: {0}")]
    ServerError(String),

    #[error("credential store unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("stored credential is invalid: {0}")]
    CredentialInvalid(String),
}

fn describe_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("with status {code}"),
        None => "before sending".to_string(),
    }
}

impl RelayError {
    /// Whether the delivery mechanism should retry the message.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::ServerError(_) | RelayError::CredentialUnavailable(_)
        )
    }

    /// Short machine-readable name, used in logs and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MalformedRequest(_) => "malformed_request",
            RelayError::AuthenticationFailed(_) => "authentication_failed",
            RelayError::ClientError { .. } => "client_error",
            RelayError::ServerError(_) => "server_error",
            RelayError::CredentialUnavailable(_) => "credential_unavailable",
            RelayError::CredentialInvalid(_) => "credential_invalid",
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => RelayError::CredentialUnavailable(msg),
            StoreError::Invalid(msg) => RelayError::CredentialInvalid(msg),
        }
    }
}

impl From<RefreshError> for RelayError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Transport(msg) => {
                RelayError::ServerError(format!("identity endpoint: {msg}"))
            }
            refused => RelayError::AuthenticationFailed(refused.to_string()),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
