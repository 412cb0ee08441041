//! Session coordinator
//!
//! Owns every live session. [`Coordinator::start`] registers a session under
//! its (workspace, project, chapter) triple and spawns a worker task that
//! reads the upstream stream; the worker races the read against the
//! session's cancellation token and the overall deadline.
//!
//! Every path into a terminal state funnels through `finalize`, which calls
//! [`Session::finish`] under the session lock. Only the first caller gets a
//! terminal event back, so exactly one `stream.completed` is published per
//! session no matter how completion, failure and cancellation interleave.
//! The chapter stays held until the merge of a completed session returns.
//!
//! Lock order is session then registry; nothing takes them the other way
//! round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use crate::audit::{AuditLog, SessionRecord};
use crate::config::{ProviderConfig, RelayConfig};
use crate::error::{RelayError, Result};
use crate::events::{EventBus, StreamEvent, TerminalEvent, Topic};
use crate::merge::{ContentMerger, MergeOutcome};
use crate::metrics::SessionMetrics;
use crate::request::{provider_for_model, CallerIdentity, GenerationRequest, ProviderRequest};
use crate::session::state::{Outcome, Session, SessionKey, SessionState};
use crate::upstream::Upstream;

/// Out-of-band request to stop a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub session_id: String,
    pub chapter_order: u32,
}

/// Receipt for a cancellation request
///
/// The effect is observed through the session's terminal event.
/// `acknowledged` is false only when the request names the wrong chapter.
/// `state` is the session state after the request, or `None` once the
/// session is no longer held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    pub session_id: String,
    pub acknowledged: bool,
    pub state: Option<SessionState>,
}

#[derive(Debug)]
struct SessionHandle {
    id: String,
    key: SessionKey,
    topic: Topic,
    provider: String,
    session: Mutex<Session>,
    cancel: CancellationToken,
    metrics: SessionMetrics,
}

#[derive(Debug, Default)]
struct Registry {
    active: HashMap<SessionKey, String>,
    sessions: HashMap<String, Arc<SessionHandle>>,
}

#[derive(Debug)]
struct Shared {
    upstream: Arc<dyn Upstream>,
    bus: Arc<dyn EventBus>,
    merger: ContentMerger,
    audit: Option<AuditLog>,
    provider: ProviderConfig,
    timeout: Duration,
    registry: Mutex<Registry>,
}

/// Starts, tracks and finalizes generation sessions
#[derive(Debug, Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Coordinator {
    /// Create a coordinator
    ///
    /// `relay.timeout()` bounds each session from acceptance to terminal
    /// state. Finished sessions are recorded in `audit` when one is given.
    pub fn new(
        upstream: Arc<dyn Upstream>,
        bus: Arc<dyn EventBus>,
        merger: ContentMerger,
        provider: ProviderConfig,
        relay: &RelayConfig,
        audit: Option<AuditLog>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                upstream,
                bus,
                merger,
                audit,
                provider,
                timeout: relay.timeout(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Accept a request and start streaming it in the background
    ///
    /// Publishes `stream.started` before returning. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidRequest` if the request fails validation
    /// and `RelayError::Conflict` if the chapter already has a live session.
    pub fn start(&self, request: GenerationRequest) -> Result<String> {
        request.validate()?;

        let id = Ulid::new().to_string();
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.shared.provider.default_model.clone());
        let session = Session::new(id.clone(), &request.caller, model.clone());
        let started = session.started_event();
        let key = session.key();

        let handle = {
            let mut registry = lock(&self.shared.registry);
            if let Some(existing) = registry.active.get(&key) {
                tracing::info!(
                    workspace_id = %key.workspace_id,
                    project_id = %key.project_id,
                    chapter_order = key.chapter_order,
                    active_session = %existing,
                    "Rejecting request, chapter already streaming"
                );
                return Err(RelayError::Conflict {
                    workspace_id: key.workspace_id.clone(),
                    project_id: key.project_id.clone(),
                    chapter_order: key.chapter_order,
                    session_id: existing.clone(),
                }
                .into());
            }

            let handle = Arc::new(SessionHandle {
                id: id.clone(),
                topic: session.topic(),
                key: key.clone(),
                provider: provider_for_model(&model).to_string(),
                session: Mutex::new(session),
                cancel: CancellationToken::new(),
                metrics: SessionMetrics::new(model),
            });
            registry.active.insert(key, id.clone());
            registry.sessions.insert(id.clone(), handle.clone());
            self.shared
                .bus
                .publish(&handle.topic, StreamEvent::Started(started));
            handle
        };

        let caller = &request.caller;
        let span = crate::session_span!(
            id,
            caller.workspace_id,
            caller.project_id,
            caller.chapter_order
        );
        span.in_scope(|| tracing::info!(user_id = %caller.user_id, "Session started"));
        tokio::spawn(self.clone().run(handle, request).instrument(span));

        Ok(id)
    }

    /// Cancel a session by id
    ///
    /// Idempotent: unknown and already-terminal sessions are left alone.
    pub fn cancel(&self, session_id: &str) -> CancelAck {
        self.cancel_matching(session_id, None)
    }

    /// Cancel a session named by an out-of-band request
    ///
    /// The request is only honoured if its chapter matches the session's.
    pub fn cancel_request(&self, request: &CancelRequest) -> CancelAck {
        self.cancel_matching(&request.session_id, Some(request.chapter_order))
    }

    /// Cancel every live session, used on shutdown
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<Arc<SessionHandle>> = lock(&self.shared.registry)
            .sessions
            .values()
            .cloned()
            .collect();

        handles
            .iter()
            .filter(|handle| self.finalize(handle, Outcome::Cancelled).is_some())
            .count()
    }

    /// State of a session still held in memory
    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let handle = lock(&self.shared.registry).sessions.get(session_id).cloned()?;
        let state = lock(&handle.session).state();
        Some(state)
    }

    /// Live session holding a chapter, if any
    pub fn active_session(&self, caller: &CallerIdentity) -> Option<String> {
        lock(&self.shared.registry)
            .active
            .get(&SessionKey::from(caller))
            .cloned()
    }

    /// Number of live sessions
    pub fn active_count(&self) -> usize {
        lock(&self.shared.registry).active.len()
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.shared.bus
    }

    pub fn merger(&self) -> &ContentMerger {
        &self.shared.merger
    }

    fn cancel_matching(&self, session_id: &str, chapter_order: Option<u32>) -> CancelAck {
        let handle = lock(&self.shared.registry).sessions.get(session_id).cloned();
        let Some(handle) = handle else {
            tracing::debug!(session_id, "Cancel for a session that is not live, ignoring");
            return CancelAck {
                session_id: session_id.to_string(),
                acknowledged: true,
                state: None,
            };
        };

        if let Some(order) = chapter_order {
            if order != handle.key.chapter_order {
                tracing::warn!(
                    session_id,
                    requested = order,
                    actual = handle.key.chapter_order,
                    "Cancel names the wrong chapter, ignoring"
                );
                let state = lock(&handle.session).state();
                return CancelAck {
                    session_id: session_id.to_string(),
                    acknowledged: false,
                    state: Some(state),
                };
            }
        }

        if self.finalize(&handle, Outcome::Cancelled).is_some() {
            tracing::info!(session_id, "Session cancelled");
        }

        let state = lock(&handle.session).state();
        CancelAck {
            session_id: session_id.to_string(),
            acknowledged: true,
            state: Some(state),
        }
    }

    async fn run(self, handle: Arc<SessionHandle>, request: GenerationRequest) {
        let deadline = Instant::now() + self.shared.timeout;

        let outcome = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(timeout = ?self.shared.timeout, "Session deadline elapsed");
                Outcome::Failed(RelayError::Timeout(self.shared.timeout.as_secs()))
            }
            result = self.drive(&handle, &request) => match result {
                Ok(()) => Outcome::Completed,
                Err(e) => Outcome::from(e),
            },
        };

        self.finalize(&handle, outcome);
    }

    /// Open the upstream stream and relay every delta
    async fn drive(
        &self,
        handle: &SessionHandle,
        request: &GenerationRequest,
    ) -> std::result::Result<(), RelayError> {
        let context = match &request.context.prior_text {
            Some(text) => text.clone(),
            None => self.chapter_context(&request.caller),
        };
        let body = ProviderRequest::build(request, &handle.id, context, &self.shared.provider);

        let mut deltas = self.shared.upstream.open(&body).await?;
        if !self.begin_streaming(handle) {
            return Err(RelayError::Cancelled);
        }
        tracing::debug!(provider = %body.provider, model = %body.model, "Upstream connected");

        while let Some(item) = deltas.next().await {
            if handle.cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let text = item?;
            if !self.relay_chunk(handle, &text) {
                return Err(RelayError::Cancelled);
            }
        }

        Ok(())
    }

    fn begin_streaming(&self, handle: &SessionHandle) -> bool {
        lock(&handle.session).begin_streaming()
    }

    /// Append and publish one delta; false once the session is terminal
    fn relay_chunk(&self, handle: &SessionHandle, text: &str) -> bool {
        let mut session = lock(&handle.session);
        match session.push_chunk(text) {
            Some(chunk) => {
                self.shared
                    .bus
                    .publish(&handle.topic, StreamEvent::Chunk(chunk));
                crate::metrics::record_chunk();
                true
            }
            None => false,
        }
    }

    /// Current body of the target chapter, or empty
    fn chapter_context(&self, caller: &CallerIdentity) -> String {
        match self.shared.merger.store().get(&caller.project_id) {
            Ok(Some(doc)) => doc
                .chapter(caller.chapter_order)
                .map(|c| c.content.clone())
                .unwrap_or_default(),
            Ok(None) => String::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not load chapter context, sending none");
                String::new()
            }
        }
    }

    /// Move a session to its terminal state and run the follow-up work
    ///
    /// Returns the terminal event if this call made the transition, `None`
    /// if the session was already terminal.
    fn finalize(&self, handle: &SessionHandle, outcome: Outcome) -> Option<TerminalEvent> {
        let (terminal, chunks) = {
            let mut session = lock(&handle.session);
            let terminal = session.finish(outcome)?;
            self.forget(handle);
            self.shared
                .bus
                .publish(&handle.topic, StreamEvent::Completed(terminal.clone()));
            (terminal, session.chunk_count())
        };

        handle.cancel.cancel();
        handle
            .metrics
            .record_finish(terminal.outcome.as_str(), chunks);

        match &terminal.error {
            Some(error) => tracing::info!(
                session_id = %handle.id,
                outcome = %terminal.outcome,
                chunks,
                error = %error,
                "Session finished"
            ),
            None => tracing::info!(
                session_id = %handle.id,
                outcome = %terminal.outcome,
                chunks,
                "Session finished"
            ),
        }

        let mut merged_version = None;
        let mut merge_error = None;
        if let Some(text) = terminal.full_text.as_deref().filter(|_| terminal.success) {
            let user_id = lock(&handle.session).user_id().to_string();
            match self.shared.merger.merge_generated(
                &handle.topic,
                terminal.chapter_order,
                text,
                &user_id,
                &handle.id,
            ) {
                Ok(MergeOutcome::Applied { version, .. }) => merged_version = Some(version),
                Ok(MergeOutcome::Skipped) => {}
                Err(e) => merge_error = Some(e.to_string()),
            }
        }
        self.release_slot(handle);

        if let Some(audit) = &self.shared.audit {
            let mut record = SessionRecord::from_session(&lock(&handle.session), &handle.provider);
            record.merged_version = merged_version;
            record.merge_error = merge_error;
            if let Err(e) = audit.save(&record) {
                tracing::warn!(session_id = %handle.id, error = %e, "Failed to write audit record");
            }
        }

        Some(terminal)
    }

    /// Drop a terminal session from the live set
    fn forget(&self, handle: &SessionHandle) {
        lock(&self.shared.registry).sessions.remove(&handle.id);
    }

    /// Free the session's chapter for the next request
    ///
    /// Runs only after the merge has returned, so a new session on the same
    /// chapter always reads the merged body as its context.
    fn release_slot(&self, handle: &SessionHandle) {
        let mut registry = lock(&self.shared.registry);
        if registry.active.get(&handle.key) == Some(&handle.id) {
            registry.active.remove(&handle.key);
        }
    }
}
