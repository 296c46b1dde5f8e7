//! Append-only execution log.
//!
//! Every node operation writes audit records through an
//! [`ExecutionLogSink`]. Entries are never mutated after append and the
//! engine never deletes them. Appends are independent, non-transactional
//! writes; no transaction spans multiple nodes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::core::errors::{EngineError, Result};
use crate::graph::config::CollectionAddress;
use crate::policy::ActionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLogStatus {
    Started,
    Retrying,
    Complete,
    Error,
}

impl fmt::Display for ExecutionLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionLogStatus::Started => "started",
            ExecutionLogStatus::Retrying => "retrying",
            ExecutionLogStatus::Complete => "complete",
            ExecutionLogStatus::Error => "error",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub request_id: String,
    pub dataset: String,
    pub collection: String,
    pub fields_affected: Vec<String>,
    pub action_type: ActionType,
    pub status: ExecutionLogStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionLogEntry {
    pub fn new(
        request_id: &str,
        address: &CollectionAddress,
        action_type: ActionType,
        status: ExecutionLogStatus,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            dataset: address.dataset.clone(),
            collection: address.collection.clone(),
            fields_affected: Vec::new(),
            action_type,
            status,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields_affected = fields;
        self
    }

    pub fn with_message<M: Into<String>>(mut self, message: M) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    async fn append(&self, entry: ExecutionLogEntry) -> Result<()>;
}

/// Durable sink: one sled tree, keys ordered `{request_id}/{seq}` so a
/// prefix scan replays a request's audit trail in append order.
pub struct SledLogSink {
    tree: sled::Tree,
    seq: AtomicU64,
}

impl SledLogSink {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).map_err(audit_err)?;
        let tree = db.open_tree("execution_log").map_err(audit_err)?;
        Ok(Self {
            tree,
            seq: AtomicU64::new(0),
        })
    }

    pub fn entries_for_request(&self, request_id: &str) -> Result<Vec<ExecutionLogEntry>> {
        let prefix = format!("{}/", request_id);
        let mut entries = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item.map_err(audit_err)?;
            let entry: ExecutionLogEntry = bincode::deserialize(&raw).map_err(audit_err)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn audit_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> EngineError {
    EngineError::Audit {
        message: err.to_string(),
        cause: Some(anyhow::Error::new(err)),
    }
}

#[async_trait]
impl ExecutionLogSink for SledLogSink {
    async fn append(&self, entry: ExecutionLogEntry) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}/{:020}", entry.request_id, seq);
        let raw = bincode::serialize(&entry).map_err(audit_err)?;
        self.tree.insert(key.as_bytes(), raw).map_err(audit_err)?;
        Ok(())
    }
}

/// In-process sink used by tests and by callers that forward entries
/// elsewhere.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<ExecutionLogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ExecutionLogEntry> {
        self.entries.lock().expect("log sink poisoned").clone()
    }

    pub fn count_status(&self, status: ExecutionLogStatus) -> usize {
        self.entries().iter().filter(|e| e.status == status).count()
    }
}

#[async_trait]
impl ExecutionLogSink for MemoryLogSink {
    async fn append(&self, entry: ExecutionLogEntry) -> Result<()> {
        self.entries.lock().expect("log sink poisoned").push(entry);
        Ok(())
    }
}
