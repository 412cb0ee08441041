//! Broadcast events and the publish/subscribe transport
//!
//! Every (workspace, project) pair has one [`Topic`]. The relay publishes
//! [`StreamEvent`]s onto it and any number of subscribers observe them.
//! Delivery is best-effort and real-time only: a subscriber sees events
//! published after it joined, and a subscriber that falls behind the
//! channel capacity skips what it missed.
//!
//! The relay core depends only on the [`EventBus`] trait;
//! [`InProcessBus`] is the tokio `broadcast` implementation used by the
//! server and the CLI.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::session::SessionState;

/// Broadcast channel scoped to one workspace/project pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub workspace_id: String,
    pub project_id: String,
}

impl Topic {
    /// Create a topic
    pub fn new(workspace_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            project_id: project_id.into(),
        }
    }

    /// Channel name, `project.<workspace>.<project>`
    ///
    /// # Examples
    ///
    /// ```
    /// use storyrelay::events::Topic;
    ///
    /// assert_eq!(Topic::new("7", "42").name(), "project.7.42");
    /// ```
    pub fn name(&self) -> String {
        format!("project.{}.{}", self.workspace_id, self.project_id)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A session was accepted and is about to contact the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedEvent {
    pub session_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub chapter_order: u32,
    pub user_id: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

/// One text fragment of a live session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEvent {
    pub session_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub chapter_order: u32,
    pub text: String,
    /// Starts at 0 and grows by one per chunk
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// The single event closing out a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub session_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub chapter_order: u32,
    pub success: bool,
    /// Concatenation of every chunk; present only on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcome: SessionState,
    pub timestamp: DateTime<Utc>,
}

/// What caused a document write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTrigger {
    Generation,
    Manual,
}

impl fmt::Display for UpdateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateTrigger::Generation => f.write_str("generation"),
            UpdateTrigger::Manual => f.write_str("manual"),
        }
    }
}

/// A chapter body changed, or a generation merge failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUpdatedEvent {
    pub workspace_id: String,
    pub project_id: String,
    pub chapter_order: u32,
    /// New chapter body; empty when the write failed
    pub content: String,
    pub trigger: UpdateTrigger,
    /// Document version after the write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Session whose text was merged, for generation-triggered updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Everything published on a topic
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamEvent {
    #[serde(rename = "stream.started")]
    Started(StartedEvent),
    #[serde(rename = "stream.chunk")]
    Chunk(ChunkEvent),
    #[serde(rename = "stream.completed")]
    Completed(TerminalEvent),
    #[serde(rename = "content.updated")]
    ContentUpdated(ContentUpdatedEvent),
}

impl StreamEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Started(_) => "stream.started",
            StreamEvent::Chunk(_) => "stream.chunk",
            StreamEvent::Completed(_) => "stream.completed",
            StreamEvent::ContentUpdated(_) => "content.updated",
        }
    }

    /// Session the event belongs to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Started(e) => Some(&e.session_id),
            StreamEvent::Chunk(e) => Some(&e.session_id),
            StreamEvent::Completed(e) => Some(&e.session_id),
            StreamEvent::ContentUpdated(e) => e.session_id.as_deref(),
        }
    }

    /// Chapter the event concerns
    pub fn chapter_order(&self) -> u32 {
        match self {
            StreamEvent::Started(e) => e.chapter_order,
            StreamEvent::Chunk(e) => e.chapter_order,
            StreamEvent::Completed(e) => e.chapter_order,
            StreamEvent::ContentUpdated(e) => e.chapter_order,
        }
    }
}

/// Stream of events observed by one subscriber
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Publish/subscribe transport
///
/// Implementations know nothing about sessions. `publish` never blocks and
/// never fails from the caller's point of view.
pub trait EventBus: Send + Sync + fmt::Debug {
    /// Fire-and-forget publish
    fn publish(&self, topic: &Topic, event: StreamEvent);

    /// Observe events published on `topic` from now on
    fn subscribe(&self, topic: &Topic) -> EventStream;
}

/// Event bus backed by one tokio broadcast channel per topic
#[derive(Debug)]
pub struct InProcessBus {
    capacity: usize,
    topics: Mutex<HashMap<Topic, broadcast::Sender<StreamEvent>>>,
}

impl InProcessBus {
    /// Create a bus whose per-topic channels buffer `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl EventBus for InProcessBus {
    fn publish(&self, topic: &Topic, event: StreamEvent) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = topics.get(topic) else {
            tracing::trace!(topic = %topic, event = event.name(), "No subscribers");
            return;
        };

        if tx.send(event).is_err() {
            // every receiver is gone
            topics.remove(topic);
        }
    }

    fn subscribe(&self, topic: &Topic) -> EventStream {
        let rx = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics
                .entry(topic.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let name = topic.name();
        Box::pin(BroadcastStream::new(rx).filter_map(move |item| {
            let name = name.clone();
            async move {
                match item {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(topic = %name, missed, "Subscriber lagged, events dropped");
                        None
                    }
                }
            }
        }))
    }
}
