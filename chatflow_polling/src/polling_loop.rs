use chatflow_core::{Backoff, FailureKind, RetryState};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{PollAttemptOutcome, PollTarget};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollFailure {
    #[error("probe failed permanently: {cause}")]
    Fatal { cause: String },

    #[error("deadline exceeded, last failure: {}", last_cause.as_deref().unwrap_or("none"))]
    DeadlineExceeded { last_cause: Option<String> },

    #[error("polling cancelled")]
    Cancelled,
}

impl PollFailure {
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Fatal { .. } => FailureKind::Fatal,
            Self::DeadlineExceeded { .. } => FailureKind::DeadlineExceeded,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Succeeded(T),
    Failed(PollFailure),
}

/// What one [`PollingLoop::run`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport<T> {
    pub outcome: PollOutcome<T>,
    /// Probes made, including the first one.
    pub attempts: u32,
    /// Waits taken between probes, in order.
    pub delays: Vec<Duration>,
}

impl<T> PollReport<T> {
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.outcome, PollOutcome::Succeeded(_))
    }
}

enum Interrupt {
    Cancelled,
    Deadline,
}

/// Drives a [`PollTarget`] until it succeeds, fails fatally, runs out of
/// time or is cancelled.
///
/// `run` takes `&mut self`, so one loop never has two runs in flight.
pub struct PollingLoop<P: PollTarget> {
    target: P,
    backoff: Box<dyn Backoff>,
    cancel: CancellationToken,
}

impl<P: PollTarget> PollingLoop<P> {
    #[must_use]
    pub fn new(target: P, backoff: impl Backoff + 'static) -> Self {
        Self {
            target,
            backoff: Box::new(backoff),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the current and any later run.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub const fn target(&self) -> &P {
        &self.target
    }

    pub async fn run(&mut self, deadline: Option<Duration>) -> PollReport<P::Output> {
        let deadline_at = deadline.map(|d| Instant::now() + d);
        let mut state = RetryState::new();
        let mut attempts = 0;
        let mut delays = Vec::new();
        let mut last_cause = None;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break PollOutcome::Failed(PollFailure::Cancelled);
            }

            attempts += 1;
            debug!("Poll attempt {attempts}");

            let probed = tokio::select! {
                biased;
                interrupt = interrupted(&self.cancel, deadline_at) => Err(interrupt),
                outcome = self.target.probe() => Ok(outcome),
            };

            let cause = match probed {
                Ok(PollAttemptOutcome::Success(value)) => {
                    info!("Poll succeeded after {attempts} attempts");
                    break PollOutcome::Succeeded(value);
                }
                Ok(PollAttemptOutcome::FatalFailure(cause)) => {
                    warn!("Poll failed permanently on attempt {attempts}: {cause}");
                    break PollOutcome::Failed(PollFailure::Fatal { cause });
                }
                Ok(PollAttemptOutcome::TransientFailure(cause)) => cause,
                Err(interrupt) => break interrupt.into_outcome(last_cause),
            };

            let delay = state.advance(self.backoff.as_ref());
            debug!("Attempt {attempts} failed: {cause}. Next poll in {delay:?}");
            last_cause = Some(cause);

            tokio::select! {
                biased;
                interrupt = interrupted(&self.cancel, deadline_at) => {
                    break interrupt.into_outcome(last_cause);
                }
                () = sleep(delay) => delays.push(delay),
            }
        };

        if let PollOutcome::Failed(failure) = &outcome {
            info!("Polling stopped after {attempts} attempts: {failure}");
        }
        PollReport {
            outcome,
            attempts,
            delays,
        }
    }
}

impl Interrupt {
    fn into_outcome<T>(self, last_cause: Option<String>) -> PollOutcome<T> {
        match self {
            Self::Cancelled => PollOutcome::Failed(PollFailure::Cancelled),
            Self::Deadline => PollOutcome::Failed(PollFailure::DeadlineExceeded { last_cause }),
        }
    }
}

async fn interrupted(cancel: &CancellationToken, deadline_at: Option<Instant>) -> Interrupt {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Interrupt::Cancelled,
        () = wait_for_deadline(deadline_at) => Interrupt::Deadline,
    }
}

async fn wait_for_deadline(deadline_at: Option<Instant>) {
    match deadline_at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
