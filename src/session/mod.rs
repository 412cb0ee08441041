//! Generation sessions
//!
//! A session is one end-to-end generation attempt for one chapter. The
//! [`Coordinator`] owns every live session: it enforces the one-active-
//! session-per-chapter rule, runs each upstream read on its own task, and
//! guarantees a single terminal event per session.

pub mod coordinator;
pub mod state;

pub use coordinator::{CancelAck, CancelRequest, Coordinator};
pub use state::{Outcome, Session, SessionKey, SessionState};
