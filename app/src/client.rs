//! HTTP client for talking to a running `chatflow worker`.

use chatflow_conversation::{HostResponse, RunId, SessionStatus};
use chatflow_core::ConversationEntry;
use reqwest::Response;

use crate::server::{ErrorBody, PromptRequest};

pub struct HostClient {
    client: reqwest::Client,
    base_url: String,
}

impl HostClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session_id: &str, path: &str) -> String {
        format!("{}/sessions/{session_id}/{path}", self.base_url)
    }

    fn run_path(run: &RunId, query: &str) -> String {
        format!("runs/{}/{query}", run.run)
    }

    /// Signal-with-start: deliver `text` to the session, creating it if absent.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        text: &str,
        request_id: Option<&str>,
    ) -> anyhow::Result<RunId> {
        let body = PromptRequest {
            text: text.to_string(),
            request_id: request_id.map(str::to_string),
        };
        let resp = self
            .client
            .post(self.session_url(session_id, "prompts"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.connection_error(&e))?;

        match Self::decode(resp).await? {
            HostResponse::Signalled { run } => Ok(run),
            other => anyhow::bail!("Unexpected response to prompt: {other:?}"),
        }
    }

    pub async fn history(&self, session_id: &str) -> anyhow::Result<Vec<ConversationEntry>> {
        match self.get(session_id, "history").await? {
            HostResponse::History { entries } => Ok(entries),
            other => anyhow::bail!("Unexpected response to history query: {other:?}"),
        }
    }

    pub async fn summary(&self, session_id: &str) -> anyhow::Result<Option<String>> {
        match self.get(session_id, "summary").await? {
            HostResponse::Summary { summary } => Ok(summary),
            other => anyhow::bail!("Unexpected response to summary query: {other:?}"),
        }
    }

    pub async fn status(&self, session_id: &str) -> anyhow::Result<(RunId, SessionStatus)> {
        match self.get(session_id, "status").await? {
            HostResponse::Status { run, status } => Ok((run, status)),
            other => anyhow::bail!("Unexpected response to status query: {other:?}"),
        }
    }

    /// Summary of one run, which may already be superseded.
    pub async fn run_summary(&self, run: &RunId) -> anyhow::Result<Option<String>> {
        match self.get(&run.session_id, &Self::run_path(run, "summary")).await? {
            HostResponse::Summary { summary } => Ok(summary),
            other => anyhow::bail!("Unexpected response to summary query: {other:?}"),
        }
    }

    async fn get(&self, session_id: &str, path: &str) -> anyhow::Result<HostResponse> {
        let resp = self
            .client
            .get(self.session_url(session_id, path))
            .send()
            .await
            .map_err(|e| self.connection_error(&e))?;
        Self::decode(resp).await
    }

    async fn decode(resp: Response) -> anyhow::Result<HostResponse> {
        let status = resp.status();
        if !status.is_success() {
            let reason = resp
                .json::<ErrorBody>()
                .await
                .map_or_else(|_| "no details".to_string(), |body| body.error);
            anyhow::bail!("Worker returned {status}: {reason}");
        }
        resp.json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse worker response: {e}"))
    }

    fn connection_error(&self, e: &reqwest::Error) -> anyhow::Error {
        anyhow::anyhow!(
            "Cannot reach worker at {}: {e}. Is 'chatflow worker' running?",
            self.base_url
        )
    }
}
