//! Upstream provider abstraction
//!
//! The coordinator talks to the text-generation provider through the
//! [`Upstream`] trait. Concrete implementations live in submodules:
//!
//! - [`reader::HttpUpstream`] -- POSTs the request and reads the streamed
//!   record body over HTTP.
//! - [`fake::FakeUpstream`] -- in-process fake used in tests (cfg(test)
//!   only).
//!
//! Record framing is in [`wire`].

use std::pin::Pin;

use futures::Stream;

use crate::error::RelayError;
use crate::request::ProviderRequest;

pub mod reader;
pub mod wire;

#[cfg(test)]
pub mod fake;

pub use reader::{decode_deltas, HttpUpstream};

/// Ordered text deltas from one upstream call
///
/// Ends cleanly on the end-of-stream sentinel. A provider error or a lost
/// connection is delivered as a single final `Err`.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

/// Source of streamed generations
#[async_trait::async_trait]
pub trait Upstream: Send + Sync + std::fmt::Debug {
    /// Start one generation and return its delta stream
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] when the provider cannot be reached
    /// or refuses the request.
    async fn open(&self, request: &ProviderRequest) -> Result<DeltaStream, RelayError>;
}
