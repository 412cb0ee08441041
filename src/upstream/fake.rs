//! In-process fake upstream for unit tests
//!
//! Each call to [`Upstream::open`] consumes the next scripted
//! [`FakeOpen`]. Streams are driven from the test through a
//! [`FakeStreamHandle`]: send deltas or a terminal error, and drop the
//! handle to end the stream cleanly.
//!
//! ```text
//! handle.send_delta("Hi") -----> delta stream -----> coordinator
//! drop(handle)            -----> end of stream
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::RelayError;
use crate::request::ProviderRequest;
use crate::upstream::{DeltaStream, Upstream};

/// Scripted result of one `open` call
#[derive(Debug)]
pub enum FakeOpen {
    /// Succeed and stream whatever the paired handle sends
    Stream(mpsc::UnboundedReceiver<Result<String, RelayError>>),
    /// Fail to connect with this error
    Fail(RelayError),
    /// Never respond
    Hang,
}

/// Test-side controller for one scripted stream
#[derive(Debug, Clone)]
pub struct FakeStreamHandle {
    tx: mpsc::UnboundedSender<Result<String, RelayError>>,
}

impl FakeStreamHandle {
    /// Deliver a text delta; returns false once the reader is gone
    pub fn send_delta(&self, text: &str) -> bool {
        self.tx.send(Ok(text.to_string())).is_ok()
    }

    /// Deliver a terminal error
    pub fn send_error(&self, error: RelayError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// True once the coordinator dropped the stream
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Upstream that replays scripted responses
#[derive(Debug, Default)]
pub struct FakeUpstream {
    script: Mutex<VecDeque<FakeOpen>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl FakeUpstream {
    /// Create a fake with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful open and return its controlling handle
    pub fn push_stream(&self) -> FakeStreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(FakeOpen::Stream(rx));
        FakeStreamHandle { tx }
    }

    /// Script an arbitrary open result
    pub fn push(&self, open: FakeOpen) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(open);
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait::async_trait]
impl Upstream for FakeUpstream {
    async fn open(&self, request: &ProviderRequest) -> Result<DeltaStream, RelayError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(FakeOpen::Stream(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            Some(FakeOpen::Fail(error)) => Err(error),
            Some(FakeOpen::Hang) => {
                futures::future::pending::<()>().await;
                unreachable!("pending future never resolves")
            }
            None => Err(RelayError::Connection("no scripted response".to_string())),
        }
    }
}
