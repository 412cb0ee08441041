//! storyrelay - generation streaming relay
//!
//! Relays incremental text from an upstream LLM provider to every client
//! watching a project, and folds the finished text into the chapter it was
//! generated for.
//!
//! # Architecture
//!
//! - `upstream`: provider HTTP stream reader and `data:` record decoding
//! - `session`: session lifecycle and the coordinator that owns live sessions
//! - `events`: event payloads and the per-project publish/subscribe bus
//! - `merge`: appending generated text to stored chapters
//! - `subscriber`: client-side view of one chapter's generation
//! - `storage`: versioned chapter documents
//! - `audit`: records of finished sessions
//! - `server`: HTTP API and SSE event streams
//! - `config`, `error`, `logging`, `metrics`: ambient plumbing
//!
//! # Example
//!
//! ```no_run
//! use storyrelay::{Config, Relay};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let relay = Relay::open(&config)?;
//!     assert_eq!(relay.coordinator.active_count(), 0);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod merge;
pub mod metrics;
pub mod relay;
pub mod request;
pub mod server;
pub mod session;
pub mod storage;
pub mod subscriber;
pub mod upstream;

// Re-export commonly used types
pub use config::Config;
pub use error::{RelayError, Result};
pub use events::{EventBus, InProcessBus, StreamEvent, Topic};
pub use relay::Relay;
pub use request::{CallerIdentity, GenerationRequest};
pub use session::{Coordinator, SessionState};
pub use subscriber::{StreamSubscriber, SubscriberUpdate};
