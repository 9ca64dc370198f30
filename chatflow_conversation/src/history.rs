//! Append-only conversation transcript.
//!
//! Entries are only ever added in user/agent pairs, once the reply for a
//! prompt is known, so a reader never sees a prompt without its answer.

use chatflow_core::{ConversationEntry, Speaker};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    entries: Vec<ConversationEntry>,
}

impl ConversationHistory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Commit one processed prompt: the user entry followed by the reply.
    pub fn push_exchange(&mut self, prompt: String, reply: String) {
        self.entries.reserve(2);
        self.entries.push(ConversationEntry {
            speaker: Speaker::User,
            message: prompt,
        });
        self.entries.push(ConversationEntry {
            speaker: Speaker::Agent,
            message: reply,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    /// Owned copy for callers outside the session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConversationEntry> {
        self.entries.clone()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
