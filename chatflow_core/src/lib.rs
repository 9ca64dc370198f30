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

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod backoff;
pub mod error;
pub mod retry;

pub use backoff::{Backoff, BackoffPolicy, RetryState};
pub use error::{CallError, FailureKind};
pub use retry::{CallRetryPolicy, RetryExhausted, retry_with_backoff};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "User"),
            Self::Agent => write!(f, "Agent"),
        }
    }
}

/// One line of the transcript. Never modified after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationEntry {
    pub speaker: Speaker,
    pub message: String,
}

impl std::fmt::Display for ConversationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.speaker, self.message)
    }
}

impl ConversationEntry {
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn agent(message: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Agent,
            message: message.into(),
        }
    }
}

/// Inbound prompt delivered to a session.
///
/// `request_id` is supplied by the caller when it wants redelivery of the
/// same logical prompt to be coalesced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptSignal {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl PromptSignal {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,
}

impl SessionConfig {
    #[must_use]
    pub const fn new(inactivity_timeout: Duration) -> Self {
        Self { inactivity_timeout }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Outbound inference calls made by a conversation session.
///
/// Both calls may fail; the caller decides whether a failure is retried
/// based on [`CallError::is_retryable`].
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        context: &[ConversationEntry],
    ) -> Result<String, CallError>;

    async fn summarize(&self, context: &[ConversationEntry]) -> Result<String, CallError>;
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_serializes_timeout_as_seconds() {
        let config = SessionConfig::new(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"inactivity_timeout":1.5}"#);

        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn prompt_without_request_id_omits_field() {
        let json = serde_json::to_string(&PromptSignal::new("hi")).unwrap();
        assert_eq!(json, r#"{"text":"hi"}"#);

        let parsed: PromptSignal = serde_json::from_str(r#"{"text":"hi","request_id":"r-1"}"#).unwrap();
        assert_eq!(parsed, PromptSignal::new("hi").with_request_id("r-1"));
    }

    #[test]
    fn speaker_display_matches_transcript_labels() {
        assert_eq!(ConversationEntry::user("a").speaker.to_string(), "User");
        assert_eq!(ConversationEntry::agent("b").speaker.to_string(), "Agent");
        assert_eq!(ConversationEntry::user("hello").to_string(), "User: hello");
    }
}
