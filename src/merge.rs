//! Durable merge of generated text into the stored document
//!
//! Generation merges and manual edits share one write path:
//! [`DocumentStore::modify`] against the latest stored state, followed by a
//! `content.updated` event on the project topic.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::events::{ContentUpdatedEvent, EventBus, StreamEvent, Topic, UpdateTrigger};
use crate::storage::{Chapter, DocumentStore, ProjectContent};

/// Append `generated` to `existing`, inserting one space when needed
///
/// A space goes in only when `existing` is non-empty and neither side of the
/// join is already whitespace.
///
/// # Examples
///
/// ```
/// use storyrelay::merge::join_with_separator;
///
/// assert_eq!(join_with_separator("Hello", "world"), "Hello world");
/// assert_eq!(join_with_separator("Hello ", "world"), "Hello world");
/// assert_eq!(join_with_separator("", "world"), "world");
/// ```
pub fn join_with_separator(existing: &str, generated: &str) -> String {
    let needs_space = !existing.is_empty()
        && !existing.ends_with(char::is_whitespace)
        && !generated.starts_with(char::is_whitespace);

    let mut joined = String::with_capacity(existing.len() + generated.len() + 1);
    joined.push_str(existing);
    if needs_space {
        joined.push(' ');
    }
    joined.push_str(generated);
    joined
}

/// Result of merging one session's text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Text was appended and committed at `version`
    Applied { version: u64, content: String },
    /// Nothing to append
    Skipped,
}

/// A user's edit to one chapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualEdit {
    /// New chapter body
    pub content: String,
    /// Renames the chapter, or names it when the edit creates it
    #[serde(default)]
    pub chapter_name: Option<String>,
    /// Version the editor started from; a mismatch is rejected
    #[serde(default)]
    pub expected_version: Option<u64>,
}

/// Writes generated text and manual edits into the document store
#[derive(Debug, Clone)]
pub struct ContentMerger {
    store: DocumentStore,
    bus: Arc<dyn EventBus>,
    max_retries: usize,
}

impl ContentMerger {
    /// Create a merger; `max_retries` bounds compare-and-swap attempts per write
    pub fn new(store: DocumentStore, bus: Arc<dyn EventBus>, max_retries: usize) -> Self {
        Self {
            store,
            bus,
            max_retries,
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Append a completed session's text to its chapter
    ///
    /// Publishes `content.updated` with trigger `generation` either way:
    /// with the new body on success, or with `success: false` and the error
    /// when the write fails.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ChapterNotFound` or `RelayError::DocumentNotFound`
    /// if the target disappeared, or a storage error.
    pub fn merge_generated(
        &self,
        topic: &Topic,
        chapter_order: u32,
        text: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<MergeOutcome> {
        if text.is_empty() {
            tracing::debug!(session_id, "Generated text is empty, nothing to merge");
            return Ok(MergeOutcome::Skipped);
        }

        let project_id = topic.project_id.as_str();
        let result = self
            .store
            .modify(project_id, user_id, self.max_retries, |doc| {
                let chapter = doc
                    .chapter_mut(chapter_order)
                    .ok_or_else(|| RelayError::ChapterNotFound {
                        project_id: project_id.to_string(),
                        chapter_order,
                    })?;
                chapter.content = join_with_separator(&chapter.content, text);
                Ok(chapter.content.clone())
            });

        match result {
            Ok((doc, content)) => {
                tracing::info!(
                    session_id,
                    project_id,
                    chapter_order,
                    version = doc.version,
                    appended = text.len(),
                    "Merged generated text"
                );
                self.publish(
                    topic,
                    chapter_order,
                    UpdateTrigger::Generation,
                    Ok((content.clone(), doc.version)),
                    Some(session_id),
                );
                Ok(MergeOutcome::Applied {
                    version: doc.version,
                    content,
                })
            }
            Err(e) => {
                tracing::error!(
                    session_id,
                    project_id,
                    chapter_order,
                    error = %e,
                    "Failed to merge generated text"
                );
                self.publish(
                    topic,
                    chapter_order,
                    UpdateTrigger::Generation,
                    Err(e.to_string()),
                    Some(session_id),
                );
                Err(e)
            }
        }
    }

    /// Replace a chapter body on behalf of a user
    ///
    /// Creates the chapter when it does not exist and the edit names it.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::VersionConflict` if `expected_version` is set and
    /// the stored document has moved on, `RelayError::ChapterNotFound` for an
    /// unnamed edit to a missing chapter.
    pub fn apply_manual_edit(
        &self,
        topic: &Topic,
        chapter_order: u32,
        edit: &ManualEdit,
        editor: &str,
    ) -> Result<ProjectContent> {
        let project_id = topic.project_id.as_str();
        let (doc, ()) = self
            .store
            .modify(project_id, editor, self.max_retries, |doc| {
                if let Some(expected) = edit.expected_version {
                    if doc.version != expected {
                        return Err(RelayError::VersionConflict {
                            expected,
                            actual: doc.version,
                        });
                    }
                }

                match doc.chapter_mut(chapter_order) {
                    Some(chapter) => {
                        chapter.content = edit.content.clone();
                        if let Some(name) = &edit.chapter_name {
                            chapter.chapter_name = name.clone();
                        }
                    }
                    None => {
                        let name = edit.chapter_name.clone().ok_or_else(|| {
                            RelayError::ChapterNotFound {
                                project_id: project_id.to_string(),
                                chapter_order,
                            }
                        })?;
                        doc.chapters
                            .push(Chapter::new(chapter_order, name, edit.content.clone()));
                        doc.chapters.sort_by_key(|c| c.order);
                    }
                }
                Ok(())
            })?;

        tracing::info!(
            project_id,
            chapter_order,
            version = doc.version,
            editor,
            "Applied manual edit"
        );
        self.publish(
            topic,
            chapter_order,
            UpdateTrigger::Manual,
            Ok((edit.content.clone(), doc.version)),
            None,
        );
        Ok(doc)
    }

    fn publish(
        &self,
        topic: &Topic,
        chapter_order: u32,
        trigger: UpdateTrigger,
        result: std::result::Result<(String, u64), String>,
        session_id: Option<&str>,
    ) {
        let (content, version, error) = match result {
            Ok((content, version)) => (content, Some(version), None),
            Err(error) => (String::new(), None, Some(error)),
        };
        let event = ContentUpdatedEvent {
            workspace_id: topic.workspace_id.clone(),
            project_id: topic.project_id.clone(),
            chapter_order,
            content,
            trigger,
            version,
            session_id: session_id.map(str::to_string),
            success: error.is_none(),
            error,
            timestamp: Utc::now(),
        };
        self.bus.publish(topic, StreamEvent::ContentUpdated(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcessBus;
    use futures::StreamExt;

    fn setup(existing: &str) -> (ContentMerger, Arc<InProcessBus>, Topic) {
        let store = DocumentStore::temporary().unwrap();
        store
            .create("p", vec![Chapter::new(0, "One", existing)], "author")
            .unwrap();
        let bus = Arc::new(InProcessBus::new(16));
        let merger = ContentMerger::new(store, bus.clone(), 8);
        (merger, bus, Topic::new("w", "p"))
    }

    #[test]
    fn test_separator_rules() {
        assert_eq!(join_with_separator("Hello", "world"), "Hello world");
        assert_eq!(join_with_separator("Hello ", "world"), "Hello world");
        assert_eq!(join_with_separator("Hello", " world"), "Hello world");
        assert_eq!(join_with_separator("Hello\n", "world"), "Hello\nworld");
        assert_eq!(join_with_separator("", "world"), "world");
        assert_eq!(join_with_separator("", " world"), " world");
    }

    #[tokio::test]
    async fn test_merge_appends_and_publishes() {
        let (merger, bus, topic) = setup("Hello");
        let mut events = bus.subscribe(&topic);

        let outcome = merger
            .merge_generated(&topic, 0, "world", "u1", "S1")
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Applied {
                version: 1,
                content: "Hello world".to_string()
            }
        );

        let doc = merger.store().require("p").unwrap();
        assert_eq!(doc.last_edited_by, "u1");

        match events.next().await.unwrap() {
            StreamEvent::ContentUpdated(e) => {
                assert!(e.success);
                assert_eq!(e.trigger, UpdateTrigger::Generation);
                assert_eq!(e.content, "Hello world");
                assert_eq!(e.session_id.as_deref(), Some("S1"));
                assert_eq!(e.version, Some(1));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_merge_empty_text_is_skipped() {
        let (merger, _bus, topic) = setup("Hello");
        let outcome = merger.merge_generated(&topic, 0, "", "u1", "S1").unwrap();
        assert_eq!(outcome, MergeOutcome::Skipped);
        assert_eq!(merger.store().require("p").unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_merge_into_missing_chapter_reports_failure() {
        let (merger, bus, topic) = setup("Hello");
        let mut events = bus.subscribe(&topic);

        let err = merger
            .merge_generated(&topic, 7, "world", "u1", "S1")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ChapterNotFound {
                chapter_order: 7,
                ..
            })
        ));

        match events.next().await.unwrap() {
            StreamEvent::ContentUpdated(e) => {
                assert!(!e.success);
                assert!(e.error.unwrap().contains("Chapter 7"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(merger.store().require("p").unwrap().version, 0);
    }

    #[test]
    fn test_merge_sees_edits_made_during_generation() {
        let (merger, _bus, topic) = setup("Hello");
        let edit = ManualEdit {
            content: "Goodbye".to_string(),
            chapter_name: None,
            expected_version: None,
        };
        merger.apply_manual_edit(&topic, 0, &edit, "editor").unwrap();

        merger
            .merge_generated(&topic, 0, "world", "u1", "S1")
            .unwrap();
        let doc = merger.store().require("p").unwrap();
        assert_eq!(doc.chapter(0).unwrap().content, "Goodbye world");
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_manual_edit_publishes_manual_trigger() {
        let (merger, bus, topic) = setup("Hello");
        let mut events = bus.subscribe(&topic);
        let edit = ManualEdit {
            content: "Rewritten".to_string(),
            chapter_name: Some("Prologue".to_string()),
            expected_version: Some(0),
        };

        let doc = merger.apply_manual_edit(&topic, 0, &edit, "editor").unwrap();
        assert_eq!(doc.chapter(0).unwrap().chapter_name, "Prologue");

        match events.next().await.unwrap() {
            StreamEvent::ContentUpdated(e) => {
                assert_eq!(e.trigger, UpdateTrigger::Manual);
                assert!(e.session_id.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_manual_edit_with_stale_version_conflicts() {
        let (merger, _bus, topic) = setup("Hello");
        merger
            .merge_generated(&topic, 0, "world", "u1", "S1")
            .unwrap();

        let edit = ManualEdit {
            content: "Overwrite".to_string(),
            chapter_name: None,
            expected_version: Some(0),
        };
        let err = merger
            .apply_manual_edit(&topic, 0, &edit, "editor")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::VersionConflict {
                expected: 0,
                actual: 1
            })
        ));
        assert_eq!(
            merger.store().require("p").unwrap().chapter(0).unwrap().content,
            "Hello world"
        );
    }

    #[test]
    fn test_manual_edit_creates_named_chapter() {
        let (merger, _bus, topic) = setup("Hello");
        let edit = ManualEdit {
            content: "New part".to_string(),
            chapter_name: Some("Two".to_string()),
            expected_version: None,
        };
        let doc = merger.apply_manual_edit(&topic, 1, &edit, "editor").unwrap();
        assert_eq!(doc.chapters.len(), 2);

        let unnamed = ManualEdit {
            chapter_name: None,
            ..edit
        };
        assert!(merger.apply_manual_edit(&topic, 5, &unnamed, "editor").is_err());
    }
}
