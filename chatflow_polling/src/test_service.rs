//! A simulated unreliable service and the activity that polls it.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::info;

use crate::{PollAttemptOutcome, PollTarget};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("test service is down (call {call})")]
pub struct TestServiceError {
    pub call: u32,
}

/// Fails the first `failures_before_success` calls, then answers.
#[derive(Debug)]
pub struct FlakyService {
    failures_before_success: u32,
    calls: AtomicU32,
}

impl FlakyService {
    #[must_use]
    pub const fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn get_service_result(&self) -> Result<String, TestServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;
        if call <= self.failures_before_success {
            return Err(TestServiceError { call });
        }
        Ok(format!("OK after {call} calls"))
    }
}

/// Polls a [`FlakyService`]. Every outage is transient.
#[derive(Debug, Clone)]
pub struct PollingActivity {
    service: Arc<FlakyService>,
}

impl PollingActivity {
    #[must_use]
    pub const fn new(service: Arc<FlakyService>) -> Self {
        Self { service }
    }

    #[must_use]
    pub const fn service(&self) -> &Arc<FlakyService> {
        &self.service
    }
}

#[async_trait]
impl PollTarget for PollingActivity {
    type Output = String;

    async fn probe(&self) -> PollAttemptOutcome<String> {
        match self.service.get_service_result().await {
            Ok(result) => PollAttemptOutcome::Success(result),
            Err(e) => {
                info!("Test service was down");
                PollAttemptOutcome::TransientFailure(e.to_string())
            }
        }
    }
}
