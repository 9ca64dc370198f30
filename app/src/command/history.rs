use chatflow_config::Config;
use chatflow_conversation::{RunId, SessionStatus};

use super::CommandStrategy;
use crate::client::HostClient;

pub struct GetHistoryInput {
    pub session: String,
}

/// Strategy for printing a session's transcript and, once it exists, its summary.
pub struct GetHistoryStrategy;

impl CommandStrategy for GetHistoryStrategy {
    type Input = GetHistoryInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let config = Config::load_or_default()?;
        let client = HostClient::new(config.host.base_url());

        let history = client.history(&input.session).await?;
        println!("Conversation History:");
        for entry in &history {
            println!("{entry}");
        }

        let (run, status) = client.status(&input.session).await?;
        if let Some(summary) = client.summary(&input.session).await? {
            println!("Conversation Summary:");
            println!("{summary}");
        } else if run.run > 1 {
            // The previous run may have finished summarizing after this one started.
            let previous = RunId::new(run.session_id.clone(), run.run - 1);
            if let Some(summary) = client.run_summary(&previous).await? {
                println!("Previous Conversation Summary ({previous}):");
                println!("{summary}");
            }
        }

        if let SessionStatus::Failed { reason } = status {
            println!("Session {run} failed: {reason}");
        }
        Ok(())
    }
}
