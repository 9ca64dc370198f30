use chatflow_config::Config;
use tracing::info;
use uuid::Uuid;

use super::CommandStrategy;
use crate::client::HostClient;

pub struct SendMessageInput {
    pub prompt: String,
    pub session: String,
    /// Generated when absent so that a retried request is not answered twice.
    pub request_id: Option<String>,
}

/// Strategy for delivering one prompt to a session through the worker.
pub struct SendMessageStrategy;

impl CommandStrategy for SendMessageStrategy {
    type Input = SendMessageInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let config = Config::load_or_default()?;
        let client = HostClient::new(config.host.base_url());

        let request_id = input
            .request_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        info!(
            "Sending prompt to session {} via {} (request id {request_id})",
            input.session,
            client.base_url()
        );

        let run = client
            .send_prompt(&input.session, &input.prompt, Some(&request_id))
            .await?;
        println!("Prompt delivered to {run}");
        Ok(())
    }
}
