use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::relay::message::IncidentRequest;

/// Append-only audit entry for a relayed request. Every attribute is a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub context: String,
    pub request_time: String,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    AuditWriteFailed(String),
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn put_record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Hex sha256 over `request_time || title || summary || context`.
///
/// The timestamp takes part, so this fingerprints a request but never dedupes it.
pub fn audit_fingerprint(request_time: &str, title: &str, summary: &str, context: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request_time.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(summary.as_bytes());
    hasher.update(context.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Build the record for `request` at `timestamp` and write it.
    pub async fn log(
        &self,
        request: &IncidentRequest,
        timestamp: DateTime<Utc>,
    ) -> Result<AuditRecord, AuditError> {
        let request_time = timestamp.to_rfc3339_opts(SecondsFormat::Micros, true);
        let record = AuditRecord {
            id: audit_fingerprint(
                &request_time,
                request.title(),
                request.summary(),
                request.context(),
            ),
            title: request.title().to_string(),
            summary: request.summary().to_string(),
            context: request.context().to_string(),
            request_time,
        };

        self.store.put_record(&record).await?;
        info!(target: "audit", event = "request_logged", audit_id = %record.id, request_time = %record.request_time);
        Ok(record)
    }
}

/// JSON-lines file, one record per line, opened in append mode per write.
#[derive(Debug)]
pub struct FileAuditStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuditStore {
    /// `{dir}/{table}.jsonl`
    pub fn new(dir: impl AsRef<Path>, table: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{table}.jsonl")),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn put_record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| AuditError::AuditWriteFailed(format!("serializing record: {e}")))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AuditError::AuditWriteFailed(format!("opening {}: {e}", self.path.display())))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AuditError::AuditWriteFailed(format!("writing {}: {e}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|e| AuditError::AuditWriteFailed(format!("flushing {}: {e}", self.path.display())))?;

        debug!(path = %self.path.display(), audit_id = %record.id, "audit record appended");
        Ok(())
    }
}

/// In-process audit store.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditStore {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn put_record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}
