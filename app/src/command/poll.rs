use chatflow_config::Config;
use chatflow_polling::{FlakyService, PollOutcome, PollingActivity, PollingLoop};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::CommandStrategy;

pub struct PollInput {
    /// Overrides `polling.deadline_secs`
    pub deadline_secs: Option<u64>,
    /// Overrides `polling.failures_before_success`
    pub failures: Option<u32>,
}

/// Strategy for polling the simulated test service until it answers.
pub struct PollStrategy;

impl CommandStrategy for PollStrategy {
    type Input = PollInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let config = Config::load_or_default()?.polling;
        let failures = input.failures.unwrap_or(config.failures_before_success);
        let deadline = input
            .deadline_secs
            .map(Duration::from_secs)
            .or_else(|| config.deadline());

        let service = Arc::new(FlakyService::new(failures));
        let mut polling = PollingLoop::new(PollingActivity::new(service), config.backoff());

        let cancel = polling.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, cancelling poll");
                cancel.cancel();
            }
        });

        info!("Polling test service ({failures} outages, deadline {deadline:?})");
        let report = polling.run(deadline).await;

        match report.outcome {
            PollOutcome::Succeeded(result) => {
                println!(
                    "Test service answered after {} attempts: {result}",
                    report.attempts
                );
                Ok(())
            }
            PollOutcome::Failed(failure) => {
                error!("Polling failed: {failure}");
                anyhow::bail!(
                    "Polling gave up after {} attempts ({:?}): {failure}",
                    report.attempts,
                    failure.kind()
                )
            }
        }
    }
}
