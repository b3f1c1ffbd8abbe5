use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::relay::config::Config;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::message::IncidentRequest;
use crate::security::audit_log::{AuditLogger, FileAuditStore};
use crate::security::credential_store::{CredentialStore, OAuthCredential};
use crate::security::token_refresh::{TokenGrant, TokenRefresher};
use crate::security::vault_client::VaultCredentialStore;
use crate::transport::incident_client::{IncidentClient, IncidentTarget};
use crate::transport::{IncidentApi, IncidentResult};

/// What to do after the first attempt.
#[derive(Debug)]
enum Step {
    Done(Option<String>),
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditStatus {
    Recorded { audit_id: String },
    Failed { reason: String },
}

/// Result of a successful invocation: the incident exists.
#[derive(Debug, Clone, Serialize)]
pub struct HandleOutcome {
    pub invocation_id: String,
    pub incident_id: Option<String>,
    pub token_refreshed: bool,
    pub audit: AuditStatus,
}

/// Per-message state machine: validate, attempt, refresh and retry at most
/// once, then audit.
#[derive(Clone)]
pub struct RequestOrchestrator {
    credentials: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenGrant>,
    incidents: Arc<dyn IncidentApi>,
    audit: AuditLogger,
}

impl RequestOrchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenGrant>,
        incidents: Arc<dyn IncidentApi>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            credentials,
            refresher,
            incidents,
            audit,
        }
    }

    /// Wire the production collaborators: Vault secret, PagerDuty identity and
    /// incident endpoints, JSON-lines audit file.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let vault = config
            .vault
            .clone()
            .context("secret store not configured: set VAULT_ADDRESS and VAULT_TOKEN")?;
        let credentials: Arc<dyn CredentialStore> = Arc::new(VaultCredentialStore::new(
            vault,
            config.secret_name.clone(),
            config.http_timeout,
        )?);

        let refresher = TokenRefresher::new(
            config.identity_url.clone(),
            config.oauth_scope.clone(),
            credentials.clone(),
            config.http_timeout,
        )?;

        let incidents = IncidentClient::new(
            &config.api_base_url,
            IncidentTarget {
                service_id: config.service_id.clone(),
                escalation_policy_id: config.escalation_policy_id.clone(),
                from_email: config.from_email.clone(),
            },
            config.http_timeout,
        )?;

        let audit = FileAuditStore::new(&config.audit_log_dir, &config.audit_table_name);
        info!(audit_path = %audit.path().display(), "relay collaborators initialized");

        Ok(Self::new(
            credentials,
            Arc::new(refresher),
            Arc::new(incidents),
            AuditLogger::new(Arc::new(audit)),
        ))
    }

    /// Handle one raw queue event.
    pub async fn handle(&self, raw_event: &str) -> RelayResult<HandleOutcome> {
        let invocation_id = Uuid::new_v4().to_string();

        let request = match IncidentRequest::from_event(raw_event) {
            Ok(r) => r,
            Err(err) => {
                warn!(invocation_id = %invocation_id, error = %err, "rejecting malformed request");
                return Err(err);
            }
        };

        let result = self.relay(&invocation_id, &request).await;
        match &result {
            Ok(outcome) => info!(
                invocation_id = %invocation_id,
                incident_id = outcome.incident_id.as_deref().unwrap_or(""),
                token_refreshed = outcome.token_refreshed,
                "request relayed"
            ),
            Err(err) => error!(
                invocation_id = %invocation_id,
                kind = err.kind(),
                retryable = err.is_retryable(),
                error = %err,
                "request failed"
            ),
        }
        result
    }

    async fn relay(&self, invocation_id: &str, request: &IncidentRequest) -> RelayResult<HandleOutcome> {
        let credential = self.credentials.get_credential().await?;

        let first = match credential.cached_token() {
            Some(token) => settle_first(self.incidents.create(request, token).await)?,
            None => {
                info!(invocation_id = %invocation_id, "no cached access token, refreshing first");
                Step::Refresh
            }
        };

        let (incident_id, token_refreshed) = match first {
            Step::Done(id) => (id, false),
            Step::Refresh => (self.refresh_and_retry(invocation_id, request, &credential).await?, true),
        };

        let audit = match self.audit.log(request, Utc::now()).await {
            Ok(record) => AuditStatus::Recorded { audit_id: record.id },
            // The incident exists regardless; report and carry on.
            Err(err) => {
                error!(target: "audit", invocation_id = %invocation_id, error = %err, "audit record was not written");
                AuditStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };

        Ok(HandleOutcome {
            invocation_id: invocation_id.to_string(),
            incident_id,
            token_refreshed,
            audit,
        })
    }

    async fn refresh_and_retry(
        &self,
        invocation_id: &str,
        request: &IncidentRequest,
        credential: &OAuthCredential,
    ) -> RelayResult<Option<String>> {
        info!(invocation_id = %invocation_id, client_id = %credential.client_id, "refreshing access token");
        let token = self
            .refresher
            .refresh(&credential.client_id, &credential.client_secret)
            .await?;

        settle_terminal(self.incidents.create(request, &token).await)
    }
}

/// A 401 on the first attempt is the only result that leads to a refresh.
fn settle_first(result: IncidentResult) -> RelayResult<Step> {
    match result {
        IncidentResult::Unauthorized => Ok(Step::Refresh),
        other => settle_terminal(other).map(Step::Done),
    }
}

/// Every result other than a first-attempt 401 ends the invocation.
fn settle_terminal(result: IncidentResult) -> RelayResult<Option<String>> {
    match result {
        IncidentResult::Created(id) => Ok(id),
        IncidentResult::Unauthorized => Err(RelayError::AuthenticationFailed(
            "incident API rejected the refreshed token".to_string(),
        )),
        IncidentResult::ClientError { status, details } => {
            Err(RelayError::ClientError { status, details })
        }
        IncidentResult::ServerError(details) => Err(RelayError::ServerError(details)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::audit_log::{AuditError, AuditRecord, AuditStore, MemoryAuditStore};
    use crate::security::credential_store::{MemoryCredentialStore, StoreError};
    use crate::security::token_refresh::RefreshError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedIncidents {
        replies: Mutex<VecDeque<IncidentResult>>,
        tokens: Mutex<Vec<String>>,
    }

    impl ScriptedIncidents {
        fn new(replies: Vec<IncidentResult>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                tokens: Mutex::new(Vec::new()),
            })
        }

        fn tokens(&self) -> Vec<String> {
            self.tokens.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IncidentApi for ScriptedIncidents {
        async fn create(&self, _request: &IncidentRequest, access_token: &str) -> IncidentResult {
            self.tokens.lock().unwrap().push(access_token.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected extra incident attempt")
        }
    }

    struct FakeGrant {
        reply: Mutex<Option<Result<String, RefreshError>>>,
        calls: AtomicUsize,
    }

    impl FakeGrant {
        fn new(reply: Result<String, RefreshError>) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(reply)),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenGrant for FakeGrant {
        async fn refresh(&self, client_id: &str, client_secret: &str) -> Result<String, RefreshError> {
            assert_eq!((client_id, client_secret), ("client-1", "secret-1"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .lock()
                .unwrap()
                .take()
                .expect("unexpected second refresh")
        }
    }

    struct CountingStore {
        inner: MemoryCredentialStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl CredentialStore for CountingStore {
        async fn get_credential(&self) -> Result<OAuthCredential, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_credential().await
        }

        async fn put_credential(&self, credential: &OAuthCredential) -> Result<(), StoreError> {
            self.inner.put_credential(credential).await
        }
    }

    struct BrokenAudit;

    #[async_trait]
    impl AuditStore for BrokenAudit {
        async fn put_record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::AuditWriteFailed("table not found".into()))
        }
    }

    struct Harness {
        store: Arc<CountingStore>,
        grant: Arc<FakeGrant>,
        incidents: Arc<ScriptedIncidents>,
        audit: MemoryAuditStore,
        orchestrator: RequestOrchestrator,
    }

    fn harness(
        credential: OAuthCredential,
        grant: Result<String, RefreshError>,
        replies: Vec<IncidentResult>,
    ) -> Harness {
        let store = Arc::new(CountingStore {
            inner: MemoryCredentialStore::new(credential),
            reads: AtomicUsize::new(0),
        });
        let grant = FakeGrant::new(grant);
        let incidents = ScriptedIncidents::new(replies);
        let audit = MemoryAuditStore::new();
        let orchestrator = RequestOrchestrator::new(
            store.clone(),
            grant.clone(),
            incidents.clone(),
            AuditLogger::new(Arc::new(audit.clone())),
        );
        Harness {
            store,
            grant,
            incidents,
            audit,
            orchestrator,
        }
    }

    fn cached() -> OAuthCredential {
        OAuthCredential::new("client-1", "secret-1").with_access_token("cached-token")
    }

    fn event(message: serde_json::Value) -> String {
        let body = json!({ "Message": message.to_string() });
        json!({ "Records": [{ "body": body.to_string() }] }).to_string()
    }

    fn valid_event() -> String {
        event(json!({
            "title": "Approve IAM role dev-org-master?",
            "summary": "Chuck is requesting dev-org-master",
            "long_context": "dev-org-master is used for admin stuff."
        }))
    }

    #[tokio::test]
    async fn test_malformed_request_touches_nothing() {
        for missing in ["title", "summary", "long_context"] {
            let mut message = json!({"title": "t", "summary": "s", "long_context": "c"});
            message.as_object_mut().unwrap().remove(missing);

            let h = harness(cached(), Ok("new".into()), vec![]);
            let err = h.orchestrator.handle(&event(message)).await.unwrap_err();

            assert!(matches!(err, RelayError::MalformedRequest(_)));
            assert!(!err.is_retryable());
            assert_eq!(h.store.reads.load(Ordering::SeqCst), 0);
            assert_eq!(h.grant.calls(), 0);
            assert!(h.incidents.tokens().is_empty());
            assert!(h.audit.records().await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_valid_token_creates_once_and_audits() {
        let h = harness(
            cached(),
            Ok("unused".into()),
            vec![IncidentResult::Created(Some("Q1ABC".into()))],
        );

        let outcome = h.orchestrator.handle(&valid_event()).await.unwrap();

        assert_eq!(outcome.incident_id.as_deref(), Some("Q1ABC"));
        assert!(!outcome.token_refreshed);
        assert_eq!(h.incidents.tokens(), vec!["cached-token"]);
        assert_eq!(h.grant.calls(), 0);

        let records = h.audit.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Approve IAM role dev-org-master?");
        assert_eq!(records[0].summary, "Chuck is requesting dev-org-master");
        assert_eq!(records[0].context, "dev-org-master is used for admin stuff.");
        assert_eq!(
            outcome.audit,
            AuditStatus::Recorded {
                audit_id: records[0].id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once_and_retries() {
        let h = harness(
            cached(),
            Ok("fresh-token".into()),
            vec![
                IncidentResult::Unauthorized,
                IncidentResult::Created(Some("Q2DEF".into())),
            ],
        );

        let outcome = h.orchestrator.handle(&valid_event()).await.unwrap();

        assert!(outcome.token_refreshed);
        assert_eq!(outcome.incident_id.as_deref(), Some("Q2DEF"));
        assert_eq!(h.grant.calls(), 1);
        assert_eq!(h.incidents.tokens(), vec!["cached-token", "fresh-token"]);
        assert_eq!(h.audit.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_terminal() {
        let h = harness(
            cached(),
            Ok("fresh-token".into()),
            vec![IncidentResult::Unauthorized, IncidentResult::Unauthorized],
        );

        let err = h.orchestrator.handle(&valid_event()).await.unwrap_err();

        assert!(matches!(err, RelayError::AuthenticationFailed(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.grant.calls(), 1);
        assert_eq!(h.incidents.tokens().len(), 2);
        assert!(h.audit.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_client_error_never_refreshes() {
        let h = harness(
            cached(),
            Ok("unused".into()),
            vec![IncidentResult::ClientError {
                status: Some(400),
                details: "Invalid Input Provided".into(),
            }],
        );

        let err = h.orchestrator.handle(&valid_event()).await.unwrap_err();

        match err {
            RelayError::ClientError { status, details } => {
                assert_eq!(status, Some(400));
                assert_eq!(details, "Invalid Input Provided");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.grant.calls(), 0);
        assert_eq!(h.incidents.tokens().len(), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_and_not_looped() {
        let h = harness(
            cached(),
            Ok("unused".into()),
            vec![IncidentResult::ServerError("status 503: down".into())],
        );

        let err = h.orchestrator.handle(&valid_event()).await.unwrap_err();

        assert!(matches!(err, RelayError::ServerError(_)));
        assert!(err.is_retryable());
        assert_eq!(h.incidents.tokens().len(), 1);
        assert_eq!(h.grant.calls(), 0);
    }

    #[tokio::test]
    async fn test_server_error_on_retry_is_retryable() {
        let h = harness(
            cached(),
            Ok("fresh-token".into()),
            vec![
                IncidentResult::Unauthorized,
                IncidentResult::ServerError("timeout".into()),
            ],
        );

        let err = h.orchestrator.handle(&valid_event()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.grant.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_authentication_failed() {
        let h = harness(
            cached(),
            Err(RefreshError::Rejected {
                status: 403,
                body: "forbidden".into(),
            }),
            vec![IncidentResult::Unauthorized],
        );

        let err = h.orchestrator.handle(&valid_event()).await.unwrap_err();

        assert!(matches!(err, RelayError::AuthenticationFailed(_)));
        assert_eq!(h.incidents.tokens().len(), 1);
        assert!(h.audit.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_cached_token_refreshes_before_single_attempt() {
        let h = harness(
            OAuthCredential::new("client-1", "secret-1"),
            Ok("fresh-token".into()),
            vec![IncidentResult::Unauthorized],
        );

        let err = h.orchestrator.handle(&valid_event()).await.unwrap_err();

        assert!(matches!(err, RelayError::AuthenticationFailed(_)));
        assert_eq!(h.grant.calls(), 1);
        assert_eq!(h.incidents.tokens(), vec!["fresh-token"]);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_invocation() {
        let incidents = ScriptedIncidents::new(vec![IncidentResult::Created(None)]);
        let orchestrator = RequestOrchestrator::new(
            Arc::new(MemoryCredentialStore::new(cached())),
            FakeGrant::new(Ok("unused".into())),
            incidents.clone(),
            AuditLogger::new(Arc::new(BrokenAudit)),
        );

        let outcome = orchestrator.handle(&valid_event()).await.unwrap();

        assert_eq!(outcome.incident_id, None);
        assert!(matches!(outcome.audit, AuditStatus::Failed { ref reason } if reason.contains("table not found")));
        assert_eq!(incidents.tokens().len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_secret_fails_before_any_attempt() {
        let incidents = ScriptedIncidents::new(vec![]);
        let orchestrator = RequestOrchestrator::new(
            Arc::new(MemoryCredentialStore::empty()),
            FakeGrant::new(Ok("unused".into())),
            incidents.clone(),
            AuditLogger::new(Arc::new(MemoryAuditStore::new())),
        );

        let err = orchestrator.handle(&valid_event()).await.unwrap_err();

        assert!(matches!(err, RelayError::CredentialInvalid(_)));
        assert!(incidents.tokens().is_empty());
    }
}
