#![warn(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Long-lived chat sessions driven by prompt signals.
//!
//! A session accepts prompts for as long as it keeps receiving them, answers
//! each one through an [`chatflow_core::InferenceGateway`] and, once it has
//! been idle for its inactivity timeout, asks the gateway for a summary and
//! finishes.
//!
//! # Key Features
//! - Pure state machine with a replayable event journal
//! - Prompts processed strictly in arrival order, one at a time
//! - Queries served from the last committed state without waiting on calls
//! - Signal-with-start that rolls over to a fresh run after a session ends

mod history;
mod host;
mod journal;
mod runtime;
mod session;

pub use history::ConversationHistory;
pub use host::{HostError, HostRequest, HostResponse, HostSettings, SessionHost, SessionQuery};
pub use journal::{EventJournal, FileJournal, JournalError, MemoryJournal, RunId};
pub use runtime::{Delivery, Redirect, RuntimeDeps, SessionHandle, SignalAck};
pub use session::{
    ConversationSession, Effect, ReplayError, SessionEvent, SessionSnapshot, SessionStatus,
};
