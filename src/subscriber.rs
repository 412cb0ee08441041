//! Client-side view of a chapter's generation
//!
//! A [`StreamSubscriber`] follows one chapter on its project topic. It picks
//! up the session announced by `stream.started`, accumulates that session's
//! chunks into a live partial text, and reconciles against the terminal
//! event. Chunks from any other session are ignored.
//!
//! Cancellation goes out-of-band through a [`CancelRequester`]: either the
//! in-process [`Coordinator`] or a [`RemoteCanceller`] talking to the HTTP
//! API.

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::{RelayError, Result};
use crate::events::{ContentUpdatedEvent, EventStream, StreamEvent, Topic};
use crate::session::{CancelAck, CancelRequest, Coordinator};

/// Something that can be asked to cancel a session
#[async_trait]
pub trait CancelRequester: Send + Sync {
    async fn request_cancel(&self, request: CancelRequest) -> Result<CancelAck>;
}

#[async_trait]
impl CancelRequester for Coordinator {
    async fn request_cancel(&self, request: CancelRequest) -> Result<CancelAck> {
        Ok(self.cancel_request(&request))
    }
}

/// Cancels sessions through the relay's HTTP API
#[derive(Debug, Clone)]
pub struct RemoteCanceller {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl RemoteCanceller {
    /// `base` is the server root, e.g. `http://127.0.0.1:8080/`
    pub fn new(base: &url::Url) -> Result<Self> {
        let endpoint = base
            .join("api/generations/cancel")
            .map_err(|e| RelayError::Config(format!("invalid server url: {}", e)))?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
        })
    }
}

#[async_trait]
impl CancelRequester for RemoteCanceller {
    async fn request_cancel(&self, request: CancelRequest) -> Result<CancelAck> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::Connection(format!("cancel request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Connection(format!(
                "cancel request returned HTTP {}",
                status
            ))
            .into());
        }

        let ack = response
            .json::<CancelAck>()
            .await
            .map_err(|e| RelayError::Connection(format!("invalid cancel response: {}", e)))?;
        Ok(ack)
    }
}

/// What a subscriber surfaces to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberUpdate {
    /// A session began on the followed chapter
    Started { session_id: String },
    /// A fragment arrived; `text` is everything so far
    Partial {
        session_id: String,
        fragment: String,
        text: String,
        sequence: u64,
    },
    /// The tracked session ended
    Finished {
        session_id: String,
        success: bool,
        text: Option<String>,
        error: Option<String>,
    },
    /// The chapter body was written
    ContentChanged(ContentUpdatedEvent),
}

/// Live view of one chapter's generation
#[derive(Debug, Clone)]
pub struct StreamSubscriber {
    topic: Topic,
    chapter_order: u32,
    tracked: Option<String>,
    buffer: String,
    streaming: bool,
    last_sequence: Option<u64>,
}

impl StreamSubscriber {
    pub fn new(topic: Topic, chapter_order: u32) -> Self {
        Self {
            topic,
            chapter_order,
            tracked: None,
            buffer: String::new(),
            streaming: false,
            last_sequence: None,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Session currently followed
    pub fn tracked_session(&self) -> Option<&str> {
        self.tracked.as_deref()
    }

    /// Partial text of the tracked session
    pub fn partial_text(&self) -> &str {
        &self.buffer
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Follow a session whose id is already known
    pub fn track(&mut self, session_id: impl Into<String>) {
        self.tracked = Some(session_id.into());
        self.buffer.clear();
        self.streaming = true;
        self.last_sequence = None;
    }

    /// Apply one topic event
    pub fn handle(&mut self, event: &StreamEvent) -> Option<SubscriberUpdate> {
        match event {
            StreamEvent::Started(e) if e.chapter_order == self.chapter_order => {
                self.track(e.session_id.clone());
                Some(SubscriberUpdate::Started {
                    session_id: e.session_id.clone(),
                })
            }
            StreamEvent::Chunk(e) if self.is_tracked(&e.session_id) => {
                if !self.streaming {
                    return None;
                }
                if self.last_sequence.is_some_and(|last| e.sequence <= last) {
                    tracing::debug!(sequence = e.sequence, "Ignoring replayed chunk");
                    return None;
                }
                self.last_sequence = Some(e.sequence);
                self.buffer.push_str(&e.text);
                Some(SubscriberUpdate::Partial {
                    session_id: e.session_id.clone(),
                    fragment: e.text.clone(),
                    text: self.buffer.clone(),
                    sequence: e.sequence,
                })
            }
            StreamEvent::Completed(e) if self.is_tracked(&e.session_id) => {
                self.streaming = false;
                self.tracked = None;
                if let Some(full) = &e.full_text {
                    self.buffer = full.clone();
                }
                Some(SubscriberUpdate::Finished {
                    session_id: e.session_id.clone(),
                    success: e.success,
                    text: e.full_text.clone(),
                    error: e.error.clone(),
                })
            }
            StreamEvent::ContentUpdated(e) if e.chapter_order == self.chapter_order => {
                Some(SubscriberUpdate::ContentChanged(e.clone()))
            }
            _ => None,
        }
    }

    /// Wait for the next update relevant to this subscriber
    ///
    /// Returns `None` once the event stream ends.
    pub async fn next_update(&mut self, events: &mut EventStream) -> Option<SubscriberUpdate> {
        while let Some(event) = events.next().await {
            if let Some(update) = self.handle(&event) {
                return Some(update);
            }
        }
        None
    }

    /// Ask for the tracked session to be cancelled
    ///
    /// Stops treating chunks as live right away; the session stays tracked
    /// until its terminal event arrives. Returns `None` when nothing is
    /// tracked.
    pub async fn request_cancel(
        &mut self,
        requester: &dyn CancelRequester,
    ) -> Result<Option<CancelAck>> {
        let Some(session_id) = self.tracked.clone() else {
            return Ok(None);
        };
        self.streaming = false;

        let ack = requester
            .request_cancel(CancelRequest {
                session_id,
                chapter_order: self.chapter_order,
            })
            .await?;
        Ok(Some(ack))
    }

    fn is_tracked(&self, session_id: &str) -> bool {
        self.tracked.as_deref() == Some(session_id)
    }
}
