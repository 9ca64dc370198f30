use async_trait::async_trait;
use chatflow_core::{CallError, ConversationEntry, InferenceGateway, Speaker};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

pub const SUMMARY_INSTRUCTION: &str = "Please produce a concise summary of the conversation above, \
in a few sentences, covering the questions asked and the answers given.";

const DEFAULT_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
const DEFAULT_MODEL: &str = "glm-4-flash";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

#[derive(Debug, Serialize, PartialEq, Eq)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> WireMessage<'a> {
    const fn system(content: &'a str) -> Self {
        Self {
            role: "system",
            content,
        }
    }

    const fn user(content: &'a str) -> Self {
        Self {
            role: "user",
            content,
        }
    }

    fn from_entry(entry: &'a ConversationEntry) -> Self {
        let role = match entry.speaker {
            Speaker::User => "user",
            Speaker::Agent => "assistant",
        };
        Self {
            role,
            content: entry.message.as_str(),
        }
    }
}

/// Gateway for any OpenAI-compatible `/chat/completions` endpoint.
///
/// The gateway makes exactly one HTTP request per call. Retrying is left to
/// the caller, which sees transient and fatal failures as distinct
/// [`CallError`] variants.
pub struct ChatCompletionsGateway {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    system_prompt: String,
    request_timeout: Option<Duration>,
}

impl ChatCompletionsGateway {
    pub fn new(api_key: String) -> Self {
        info!("Creating ChatCompletionsGateway");
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: String) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn generate_messages<'a>(
        &'a self,
        prompt: &'a str,
        context: &'a [ConversationEntry],
    ) -> Vec<WireMessage<'a>> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(WireMessage::system(&self.system_prompt));
        messages.extend(context.iter().map(WireMessage::from_entry));
        messages.push(WireMessage::user(prompt));
        messages
    }

    fn summary_messages<'a>(&'a self, context: &'a [ConversationEntry]) -> Vec<WireMessage<'a>> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(WireMessage::system(&self.system_prompt));
        messages.extend(context.iter().map(WireMessage::from_entry));
        messages.push(WireMessage::user(SUMMARY_INSTRUCTION));
        messages
    }

    /// Send a single request and extract the first choice's content.
    async fn try_send(&self, messages: &[WireMessage<'_>]) -> Result<String, CallError> {
        let request = json!({
            "model": self.model,
            "messages": messages,
        });

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(classify_transport_error)?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CallError::fatal("invalid response format: missing content"))
    }
}

/// Map an HTTP error status onto the retry taxonomy.
///
/// Request timeouts, rate limiting and server errors are transient; any
/// other status is a permanent rejection.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> CallError {
    let cause = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        CallError::Transient(cause)
    } else {
        CallError::Fatal(cause)
    }
}

fn classify_transport_error(error: reqwest::Error) -> CallError {
    if error.is_decode() {
        return CallError::fatal(format!("malformed response body: {error}"));
    }
    if let Some(status) = error.status() {
        return classify_status(status, "");
    }
    if error.is_builder() {
        return CallError::fatal(error.to_string());
    }
    CallError::transient(error.to_string())
}

#[async_trait]
impl InferenceGateway for ChatCompletionsGateway {
    async fn generate(
        &self,
        prompt: &str,
        context: &[ConversationEntry],
    ) -> Result<String, CallError> {
        info!(
            "Sending generate request: model={}, context_len={}",
            self.model,
            context.len()
        );
        let reply = self.try_send(&self.generate_messages(prompt, context)).await?;
        debug!("Received reply of {} chars", reply.len());
        Ok(reply)
    }

    async fn summarize(&self, context: &[ConversationEntry]) -> Result<String, CallError> {
        info!(
            "Sending summary request: model={}, context_len={}",
            self.model,
            context.len()
        );
        self.try_send(&self.summary_messages(context)).await
    }
}
