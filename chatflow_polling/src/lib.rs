#![deny(
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

//! Periodic polling of an unreliable service with capped exponential backoff.

use async_trait::async_trait;

mod polling_loop;
mod test_service;

pub use polling_loop::{PollFailure, PollOutcome, PollReport, PollingLoop};
pub use test_service::{FlakyService, PollingActivity, TestServiceError};

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAttemptOutcome<T> {
    Success(T),
    /// Worth trying again after a delay.
    TransientFailure(String),
    /// Stop polling, retrying cannot help.
    FatalFailure(String),
}

#[async_trait]
pub trait PollTarget: Send + Sync {
    type Output: Send;

    async fn probe(&self) -> PollAttemptOutcome<Self::Output>;
}
