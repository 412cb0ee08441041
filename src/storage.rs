//! Versioned chapter storage
//!
//! Each project has one [`ProjectContent`] document stored as JSON in an
//! embedded `sled` database. Every write goes through
//! [`DocumentStore::modify`], a reload-modify-write loop that commits with
//! compare-and-swap against the exact bytes it read. A concurrent writer
//! makes the swap fail and the closure runs again on the fresh document, so
//! generation merges and manual edits never overwrite each other.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;

use crate::config::StorageConfig;
use crate::error::{RelayError, Result};

/// One chapter of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Position within the document
    pub order: u32,
    pub chapter_name: String,
    pub content: String,
}

impl Chapter {
    pub fn new(order: u32, chapter_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            order,
            chapter_name: chapter_name.into(),
            content: content.into(),
        }
    }
}

/// The stored document of one project
///
/// # Examples
///
/// ```
/// use storyrelay::storage::{Chapter, ProjectContent};
///
/// let doc = ProjectContent::new(vec![Chapter::new(0, "Opening", "It was late.")], "u1");
/// assert_eq!(doc.version, 0);
/// assert_eq!(doc.word_count(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContent {
    /// Chapters sorted by `order`
    pub chapters: Vec<Chapter>,
    /// Bumped by every committed write
    pub version: u64,
    pub last_edited_at: DateTime<Utc>,
    pub last_edited_by: String,
}

impl ProjectContent {
    /// Build a version-0 document
    pub fn new(mut chapters: Vec<Chapter>, editor: impl Into<String>) -> Self {
        chapters.sort_by_key(|c| c.order);
        Self {
            chapters,
            version: 0,
            last_edited_at: Utc::now(),
            last_edited_by: editor.into(),
        }
    }

    pub fn chapter(&self, order: u32) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.order == order)
    }

    pub fn chapter_mut(&mut self, order: u32) -> Option<&mut Chapter> {
        self.chapters.iter_mut().find(|c| c.order == order)
    }

    /// Whitespace-separated words across all chapters
    pub fn word_count(&self) -> usize {
        self.chapters
            .iter()
            .map(|c| c.content.split_whitespace().count())
            .sum()
    }
}

/// Document store backed by `sled`
#[derive(Debug, Clone)]
pub struct DocumentStore {
    db: Db,
}

impl DocumentStore {
    /// Open or create a store at `path`
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
            .map_err(|e| RelayError::Storage(format!("Failed to open content database: {}", e)))?;
        Ok(Self { db })
    }

    /// Open a throwaway in-memory store
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| RelayError::Storage(format!("Failed to open content database: {}", e)))?;
        Ok(Self { db })
    }

    /// Open the store described by the storage config
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.temporary {
            Self::temporary()
        } else {
            Self::new(&config.content_path)
        }
    }

    /// Create the document for a project
    ///
    /// # Errors
    ///
    /// Returns `RelayError::DocumentExists` if the project already has one,
    /// and `RelayError::InvalidRequest` if two chapters share an order.
    pub fn create(
        &self,
        project_id: &str,
        chapters: Vec<Chapter>,
        editor: &str,
    ) -> Result<ProjectContent> {
        let doc = ProjectContent::new(chapters, editor);
        if doc.chapters.windows(2).any(|w| w[0].order == w[1].order) {
            return Err(RelayError::InvalidRequest(
                "chapter orders must be unique".to_string(),
            )
            .into());
        }

        let encoded = serde_json::to_vec(&doc)
            .map_err(|e| RelayError::Storage(format!("Serialization failed: {}", e)))?;

        let swapped = self
            .db
            .compare_and_swap(project_id.as_bytes(), None as Option<&[u8]>, Some(encoded))
            .map_err(|e| RelayError::Storage(format!("Insert failed: {}", e)))?;
        if swapped.is_err() {
            return Err(RelayError::DocumentExists(project_id.to_string()).into());
        }

        self.flush()?;
        tracing::info!(project_id, chapters = doc.chapters.len(), "Created document");
        Ok(doc)
    }

    /// Load a project's document
    pub fn get(&self, project_id: &str) -> Result<Option<ProjectContent>> {
        match self
            .db
            .get(project_id.as_bytes())
            .map_err(|e| RelayError::Storage(format!("Get failed: {}", e)))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load a project's document, failing if it does not exist
    pub fn require(&self, project_id: &str) -> Result<ProjectContent> {
        self.get(project_id)?
            .ok_or_else(|| RelayError::DocumentNotFound(project_id.to_string()).into())
    }

    /// Project ids with a stored document
    pub fn list_projects(&self) -> Result<Vec<String>> {
        self.db
            .iter()
            .keys()
            .map(|key| -> Result<String> {
                let key = key.map_err(|e| RelayError::Storage(format!("Iteration failed: {}", e)))?;
                Ok(String::from_utf8_lossy(&key).into_owned())
            })
            .collect()
    }

    /// Reload-modify-write a document
    ///
    /// `apply` runs against the latest stored document and may run more than
    /// once if another writer commits first. An `Err` from `apply` aborts
    /// without writing. On success the version is bumped, the editor
    /// recorded, and the committed document returned with `apply`'s value.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::DocumentNotFound` if the project has no
    /// document, whatever `apply` returns, or `RelayError::Storage` if
    /// `max_attempts` swaps all lose a race.
    pub fn modify<T, F>(
        &self,
        project_id: &str,
        editor: &str,
        max_attempts: usize,
        mut apply: F,
    ) -> Result<(ProjectContent, T)>
    where
        F: FnMut(&mut ProjectContent) -> std::result::Result<T, RelayError>,
    {
        let key = project_id.as_bytes();

        for attempt in 1..=max_attempts.max(1) {
            let current = self
                .db
                .get(key)
                .map_err(|e| RelayError::Storage(format!("Get failed: {}", e)))?
                .ok_or_else(|| RelayError::DocumentNotFound(project_id.to_string()))?;

            let mut doc = decode(&current)?;
            let value = apply(&mut doc)?;
            doc.version += 1;
            doc.last_edited_at = Utc::now();
            doc.last_edited_by = editor.to_string();

            let encoded = serde_json::to_vec(&doc)
                .map_err(|e| RelayError::Storage(format!("Serialization failed: {}", e)))?;

            let swapped = self
                .db
                .compare_and_swap(key, Some(&current), Some(encoded))
                .map_err(|e| RelayError::Storage(format!("Write failed: {}", e)))?;

            match swapped {
                Ok(()) => {
                    self.flush()?;
                    return Ok((doc, value));
                }
                Err(_) => {
                    tracing::debug!(project_id, attempt, "Document changed underneath, retrying");
                }
            }
        }

        Err(RelayError::Storage(format!(
            "gave up writing document for project {} after {} attempts",
            project_id, max_attempts
        ))
        .into())
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| RelayError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<ProjectContent> {
    Ok(serde_json::from_slice(bytes)
        .map_err(|e| RelayError::Storage(format!("Deserialization failed: {}", e)))?)
}
