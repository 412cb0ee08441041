//! Audit log of finished sessions
//!
//! One [`SessionRecord`] per session, written once the session is terminal
//! and its merge (if any) has run. Keys are the ULID session ids, so the
//! tree iterates in start order.

use crate::error::{RelayError, Result};
use crate::session::{Session, SessionState};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;

/// Persisted summary of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier (ULID)
    pub id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub chapter_order: u32,
    pub user_id: String,
    pub model: String,
    pub provider: String,
    /// Terminal state
    pub state: SessionState,
    pub chunk_count: u64,
    /// Bytes of generated text, kept even when the text was discarded
    pub text_length: usize,
    pub error: Option<String>,
    /// Document version the text was merged at
    pub merged_version: Option<u64>,
    pub merge_error: Option<String>,
    /// Start timestamp (RFC-3339)
    pub started_at: String,
    /// End timestamp (RFC-3339)
    pub ended_at: Option<String>,
}

impl SessionRecord {
    /// Summarize a terminal session
    pub fn from_session(session: &Session, provider: &str) -> Self {
        Self {
            id: session.id().to_string(),
            workspace_id: session.workspace_id().to_string(),
            project_id: session.project_id().to_string(),
            chapter_order: session.chapter_order(),
            user_id: session.user_id().to_string(),
            model: session.model().to_string(),
            provider: provider.to_string(),
            state: session.state(),
            chunk_count: session.chunk_count(),
            text_length: session.text().len(),
            error: session.error().map(str::to_string),
            merged_version: None,
            merge_error: None,
            started_at: session.started_at().to_rfc3339(),
            ended_at: session.ended_at().map(|t| t.to_rfc3339()),
        }
    }
}

/// Session audit store backed by `sled`
#[derive(Debug, Clone)]
pub struct AuditLog {
    db: Db,
}

impl AuditLog {
    /// Open or create an audit log at `path`
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Storage` if the database cannot be opened
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = sled::open(path)
            .map_err(|e| RelayError::Storage(format!("Failed to open audit database: {}", e)))?;
        Ok(Self { db })
    }

    /// Open a throwaway in-memory log
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| RelayError::Storage(format!("Failed to open audit database: {}", e)))?;
        Ok(Self { db })
    }

    /// Open the log described by the storage config
    pub fn from_config(config: &crate::config::StorageConfig) -> Result<Self> {
        if config.temporary {
            Self::temporary()
        } else {
            Self::new(&config.audit_path)
        }
    }

    /// Save a record, replacing any record with the same id
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let value = serde_json::to_vec(record)
            .map_err(|e| RelayError::Storage(format!("Serialization failed: {}", e)))?;

        self.db
            .insert(record.id.as_bytes(), value)
            .map_err(|e| RelayError::Storage(format!("Insert failed: {}", e)))?;

        self.db
            .flush()
            .map_err(|e| RelayError::Storage(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    /// Retrieve a record by session id
    pub fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        match self
            .db
            .get(id.as_bytes())
            .map_err(|e| RelayError::Storage(format!("Get failed: {}", e)))?
        {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|e| RelayError::Storage(format!("Deserialization failed: {}", e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List records newest first
    ///
    /// # Arguments
    ///
    /// * `limit` - Maximum number of records to return
    /// * `offset` - Number of newest records to skip
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for result in self.db.iter().rev().skip(offset) {
            if records.len() >= limit {
                break;
            }
            let (_, value) =
                result.map_err(|e| RelayError::Storage(format!("Iteration failed: {}", e)))?;
            let record: SessionRecord = serde_json::from_slice(&value)
                .map_err(|e| RelayError::Storage(format!("Deserialization failed: {}", e)))?;
            records.push(record);
        }
        Ok(records)
    }

    /// All records for one project, newest first
    pub fn find_by_project(&self, project_id: &str) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for result in self.db.iter().rev() {
            let (_, value) =
                result.map_err(|e| RelayError::Storage(format!("Iteration failed: {}", e)))?;
            let record: SessionRecord = serde_json::from_slice(&value)
                .map_err(|e| RelayError::Storage(format!("Deserialization failed: {}", e)))?;
            if record.project_id == project_id {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}
