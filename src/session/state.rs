//! Session state machine
//!
//! ```text
//! PENDING --open--> STREAMING --clean end--> COMPLETED
//! PENDING | STREAMING --error / timeout--> FAILED
//! PENDING | STREAMING --cancel--> CANCELLED
//! ```
//!
//! [`Session::finish`] is the only way into a terminal state and returns the
//! terminal event exactly once.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::events::{ChunkEvent, StartedEvent, TerminalEvent, Topic};
use crate::request::CallerIdentity;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// True for COMPLETED, FAILED and CANCELLED
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Whether the state machine allows `self -> next`
    ///
    /// # Examples
    ///
    /// ```
    /// use storyrelay::session::SessionState;
    ///
    /// assert!(SessionState::Pending.can_transition_to(SessionState::Cancelled));
    /// assert!(!SessionState::Pending.can_transition_to(SessionState::Completed));
    /// assert!(!SessionState::Failed.can_transition_to(SessionState::Cancelled));
    /// ```
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Streaming)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Streaming, Completed)
                | (Streaming, Failed)
                | (Streaming, Cancelled)
        )
    }

    /// Lowercase label for logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    /// Uppercase label, as serialized and as shown to users
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Pending => "PENDING",
            SessionState::Streaming => "STREAMING",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
            SessionState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Failed(RelayError),
    Cancelled,
}

impl Outcome {
    fn target(&self) -> SessionState {
        match self {
            Outcome::Completed => SessionState::Completed,
            Outcome::Failed(_) => SessionState::Failed,
            Outcome::Cancelled => SessionState::Cancelled,
        }
    }
}

impl From<RelayError> for Outcome {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::Cancelled => Outcome::Cancelled,
            other => Outcome::Failed(other),
        }
    }
}

/// The (workspace, project, chapter) triple at most one live session may hold
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub workspace_id: String,
    pub project_id: String,
    pub chapter_order: u32,
}

impl From<&CallerIdentity> for SessionKey {
    fn from(caller: &CallerIdentity) -> Self {
        Self {
            workspace_id: caller.workspace_id.clone(),
            project_id: caller.project_id.clone(),
            chapter_order: caller.chapter_order,
        }
    }
}

/// In-memory record of one generation attempt
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    workspace_id: String,
    project_id: String,
    chapter_order: u32,
    user_id: String,
    model: String,
    state: SessionState,
    next_sequence: u64,
    text: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
    error_kind: Option<&'static str>,
}

impl Session {
    /// Create a PENDING session for `caller`
    pub fn new(id: impl Into<String>, caller: &CallerIdentity, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace_id: caller.workspace_id.clone(),
            project_id: caller.project_id.clone(),
            chapter_order: caller.chapter_order,
            user_id: caller.user_id.clone(),
            model: model.into(),
            state: SessionState::Pending,
            next_sequence: 0,
            text: String::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn chapter_order(&self) -> u32 {
        self.chapter_order
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Accumulated text so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of chunks accepted
    pub fn chunk_count(&self) -> u64 {
        self.next_sequence
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Terminal error description, if the session did not complete
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Error category label, if the session failed
    pub fn error_kind(&self) -> Option<&'static str> {
        self.error_kind
    }

    pub fn topic(&self) -> Topic {
        Topic::new(&self.workspace_id, &self.project_id)
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            workspace_id: self.workspace_id.clone(),
            project_id: self.project_id.clone(),
            chapter_order: self.chapter_order,
        }
    }

    /// Event announcing this session
    pub fn started_event(&self) -> StartedEvent {
        StartedEvent {
            session_id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            project_id: self.project_id.clone(),
            chapter_order: self.chapter_order,
            user_id: self.user_id.clone(),
            model: self.model.clone(),
            timestamp: self.started_at,
        }
    }

    /// PENDING -> STREAMING; false if the session already left PENDING
    pub fn begin_streaming(&mut self) -> bool {
        if !self.state.can_transition_to(SessionState::Streaming) {
            return false;
        }
        self.state = SessionState::Streaming;
        true
    }

    /// Append a fragment and return its chunk event
    ///
    /// Returns `None` unless the session is STREAMING, so nothing can be
    /// emitted after the terminal event.
    pub fn push_chunk(&mut self, text: &str) -> Option<ChunkEvent> {
        if self.state != SessionState::Streaming {
            return None;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.text.push_str(text);

        Some(ChunkEvent {
            session_id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            project_id: self.project_id.clone(),
            chapter_order: self.chapter_order,
            text: text.to_string(),
            sequence,
            timestamp: Utc::now(),
        })
    }

    /// Drive the session to its terminal state
    ///
    /// Returns the terminal event on the first call that reaches a terminal
    /// state and `None` on every later call. Accumulated text is only
    /// carried on success.
    pub fn finish(&mut self, outcome: Outcome) -> Option<TerminalEvent> {
        let target = outcome.target();
        if !self.state.can_transition_to(target) {
            return None;
        }

        let now = Utc::now();
        self.state = target;
        self.ended_at = Some(now);

        let (success, full_text) = match outcome {
            Outcome::Completed => (true, Some(self.text.clone())),
            Outcome::Failed(error) => {
                self.error_kind = Some(error.kind());
                self.error = Some(match error {
                    RelayError::Provider(message) => message,
                    other => other.to_string(),
                });
                (false, None)
            }
            Outcome::Cancelled => {
                self.error_kind = Some(RelayError::Cancelled.kind());
                self.error = Some(RelayError::Cancelled.to_string());
                (false, None)
            }
        };

        Some(TerminalEvent {
            session_id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            project_id: self.project_id.clone(),
            chapter_order: self.chapter_order,
            success,
            full_text,
            error: self.error.clone(),
            outcome: target,
            timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_matches_serialized_form() {
        for state in [
            SessionState::Pending,
            SessionState::Streaming,
            SessionState::Completed,
            SessionState::Failed,
            SessionState::Cancelled,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.label()));
        }
        assert_eq!(SessionState::Completed.label(), "COMPLETED");
        assert_eq!(SessionState::Completed.to_string(), "completed");
    }

    fn session() -> Session {
        let caller = CallerIdentity {
            user_id: "u".to_string(),
            workspace_id: "w".to_string(),
            project_id: "p".to_string(),
            chapter_order: 2,
        };
        Session::new("S1", &caller, "gpt-4o-mini")
    }

    #[test]
    fn test_new_session_is_pending() {
        let s = session();
        assert_eq!(s.state(), SessionState::Pending);
        assert_eq!(s.chunk_count(), 0);
        assert!(s.ended_at().is_none());
        assert_eq!(s.topic().name(), "project.w.p");
    }

    #[test]
    fn test_chunks_rejected_before_streaming() {
        let mut s = session();
        assert!(s.push_chunk("early").is_none());
        assert!(s.text().is_empty());
    }

    #[test]
    fn test_sequences_start_at_zero_without_gaps() {
        let mut s = session();
        assert!(s.begin_streaming());
        let seqs: Vec<u64> = ["a", "b", "c"]
            .iter()
            .map(|t| s.push_chunk(t).unwrap().sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(s.text(), "abc");
    }

    #[test]
    fn test_completed_carries_full_text() {
        let mut s = session();
        s.begin_streaming();
        s.push_chunk("Hello");
        s.push_chunk(" world");

        let terminal = s.finish(Outcome::Completed).unwrap();
        assert!(terminal.success);
        assert_eq!(terminal.full_text.as_deref(), Some("Hello world"));
        assert_eq!(terminal.outcome, SessionState::Completed);
        assert!(terminal.error.is_none());
    }

    #[test]
    fn test_finish_is_exactly_once() {
        let mut s = session();
        s.begin_streaming();
        assert!(s.finish(Outcome::Cancelled).is_some());
        assert!(s.finish(Outcome::Completed).is_none());
        assert!(s.finish(Outcome::Failed(RelayError::Timeout(1))).is_none());
        assert!(s.finish(Outcome::Cancelled).is_none());
        assert_eq!(s.state(), SessionState::Cancelled);
        assert!(s.push_chunk("late").is_none());
    }

    #[test]
    fn test_provider_failure_keeps_provider_message() {
        let mut s = session();
        s.begin_streaming();
        s.push_chunk("partial");

        let terminal = s
            .finish(Outcome::Failed(RelayError::Provider("x".to_string())))
            .unwrap();
        assert!(!terminal.success);
        assert_eq!(terminal.error.as_deref(), Some("x"));
        assert!(terminal.full_text.is_none());
        assert_eq!(s.error_kind(), Some("provider"));
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut s = session();
        assert!(s.finish(Outcome::Completed).is_none());
        assert_eq!(s.state(), SessionState::Pending);
        assert!(s.finish(Outcome::Cancelled).is_some());
    }

    #[test]
    fn test_cancelled_outcome_from_error() {
        assert!(matches!(
            Outcome::from(RelayError::Cancelled),
            Outcome::Cancelled
        ));
        assert!(matches!(
            Outcome::from(RelayError::Timeout(3)),
            Outcome::Failed(RelayError::Timeout(3))
        ));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionState::Streaming).unwrap(),
            "\"STREAMING\""
        );
        assert!(SessionState::Cancelled.is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
    }
}
