//! Conversation session state machine.
//!
//! [`ConversationSession::apply`] is a pure transition: it folds one
//! [`SessionEvent`] into the state and returns the [`Effect`]s the runtime
//! must carry out. It never performs I/O, so replaying a journal of events
//! rebuilds exactly the same state without repeating any external call.
//!
//! ```text
//! Active ──prompt/reply──▶ Active
//!   │ inactivity timer (idle, current timer)
//!   ▼
//! Summarizing ──summary──▶ Done
//!   (any in-flight call abandoned ──▶ Failed)
//! ```

use chatflow_core::{ConversationEntry, PromptSignal, SessionConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::history::ConversationHistory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Summarizing,
    Done,
    /// Abandoned after a call failed permanently. History is frozen at the
    /// last commit and no summary will be produced.
    Failed { reason: String },
}

impl SessionStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }
}

/// Everything that can happen to a session, in the order the host delivers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { config: SessionConfig },
    PromptReceived { prompt: PromptSignal },
    ReplyReceived { call_id: u64, reply: String },
    InactivityElapsed { timer_id: u64 },
    SummaryReceived { call_id: u64, summary: String },
    CallAbandoned { call_id: u64, reason: String },
}

/// Work requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Generate {
        call_id: u64,
        prompt: String,
        context: Vec<ConversationEntry>,
    },
    Summarize {
        call_id: u64,
        context: Vec<ConversationEntry>,
    },
    ArmTimer {
        timer_id: u64,
        after: Duration,
    },
    /// The session no longer takes prompts; deliver this one to a fresh run.
    Redirect { prompt: PromptSignal },
    Finished { summary: String },
    Abandoned { reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("journal is empty")]
    Empty,

    #[error("journal does not begin with a start event")]
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Generate { call_id: u64, prompt: String },
    Summarize { call_id: u64 },
}

impl Call {
    const fn id(&self) -> u64 {
        match self {
            Self::Generate { call_id, .. } | Self::Summarize { call_id } => *call_id,
        }
    }
}

/// Committed, reader-visible state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub history: Vec<ConversationEntry>,
    pub summary: Option<String>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    config: SessionConfig,
    status: SessionStatus,
    history: ConversationHistory,
    summary: Option<String>,
    pending: VecDeque<PromptSignal>,
    in_flight: Option<Call>,
    seen_requests: HashSet<String>,
    next_call_id: u64,
    timer_id: u64,
}

impl ConversationSession {
    /// Create a session in `Active` with an empty history and arm its timer.
    #[must_use]
    pub fn start(config: SessionConfig) -> (Self, Vec<Effect>) {
        let mut session = Self {
            config,
            status: SessionStatus::Active,
            history: ConversationHistory::new(),
            summary: None,
            pending: VecDeque::new(),
            in_flight: None,
            seen_requests: HashSet::new(),
            next_call_id: 0,
            timer_id: 0,
        };
        let effect = session.arm_timer();
        (session, vec![effect])
    }

    /// Rebuild a session from its journal, discarding the effects.
    ///
    /// Use [`Self::resume_effects`] afterwards to restart whatever was
    /// outstanding when the journal was written.
    pub fn replay<I>(events: I) -> Result<Self, ReplayError>
    where
        I: IntoIterator<Item = SessionEvent>,
    {
        let mut events = events.into_iter();
        let config = match events.next() {
            Some(SessionEvent::Started { config }) => config,
            Some(_) => return Err(ReplayError::NotStarted),
            None => return Err(ReplayError::Empty),
        };

        let (mut session, _) = Self::start(config);
        for event in events {
            session.apply(event);
        }
        Ok(session)
    }

    /// Effects needed to continue after a replay: the in-flight call, if
    /// any, or a fresh inactivity timer when the session is idle.
    #[must_use]
    pub fn resume_effects(&self) -> Vec<Effect> {
        match (&self.status, &self.in_flight) {
            (_, Some(Call::Generate { call_id, prompt })) => vec![Effect::Generate {
                call_id: *call_id,
                prompt: prompt.clone(),
                context: self.history.snapshot(),
            }],
            (_, Some(Call::Summarize { call_id })) => vec![Effect::Summarize {
                call_id: *call_id,
                context: self.history.snapshot(),
            }],
            (SessionStatus::Active, None) => vec![Effect::ArmTimer {
                timer_id: self.timer_id,
                after: self.config.inactivity_timeout,
            }],
            _ => Vec::new(),
        }
    }

    pub fn apply(&mut self, event: SessionEvent) -> Vec<Effect> {
        match event {
            SessionEvent::Started { .. } => {
                debug!("Ignoring start event for a running session");
                Vec::new()
            }
            SessionEvent::PromptReceived { prompt } => self.on_prompt(prompt),
            SessionEvent::ReplyReceived { call_id, reply } => self.on_reply(call_id, reply),
            SessionEvent::InactivityElapsed { timer_id } => self.on_inactivity_timeout(timer_id),
            SessionEvent::SummaryReceived { call_id, summary } => self.on_summary(call_id, summary),
            SessionEvent::CallAbandoned { call_id, reason } => self.on_abandoned(call_id, reason),
        }
    }

    fn on_prompt(&mut self, prompt: PromptSignal) -> Vec<Effect> {
        if !self.accepts_prompts() {
            return vec![Effect::Redirect { prompt }];
        }

        if let Some(request_id) = &prompt.request_id {
            if !self.seen_requests.insert(request_id.clone()) {
                debug!("Dropping duplicate prompt with request id {request_id}");
                return Vec::new();
            }
        }

        if self.in_flight.is_some() {
            self.pending.push_back(prompt);
            return Vec::new();
        }

        vec![self.begin_generate(prompt.text)]
    }

    fn on_reply(&mut self, call_id: u64, reply: String) -> Vec<Effect> {
        let prompt = match self.in_flight.take() {
            Some(Call::Generate {
                call_id: current,
                prompt,
            }) if current == call_id => prompt,
            other => {
                debug!("Ignoring reply for call {call_id} that is not in flight");
                self.in_flight = other;
                return Vec::new();
            }
        };

        self.history.push_exchange(prompt, reply);

        match self.pending.pop_front() {
            Some(next) => vec![self.begin_generate(next.text)],
            None => vec![self.arm_timer()],
        }
    }

    fn on_inactivity_timeout(&mut self, timer_id: u64) -> Vec<Effect> {
        let idle = self.in_flight.is_none() && self.pending.is_empty();
        if self.status != SessionStatus::Active || timer_id != self.timer_id || !idle {
            debug!("Ignoring stale inactivity timer {timer_id}");
            return Vec::new();
        }

        self.status = SessionStatus::Summarizing;
        let call_id = self.next_call_id();
        self.in_flight = Some(Call::Summarize { call_id });
        vec![Effect::Summarize {
            call_id,
            context: self.history.snapshot(),
        }]
    }

    fn on_summary(&mut self, call_id: u64, summary: String) -> Vec<Effect> {
        let matches = matches!(
            self.in_flight,
            Some(Call::Summarize { call_id: current }) if current == call_id
        );
        if !matches || self.summary.is_some() {
            debug!("Ignoring summary for call {call_id} that is not in flight");
            return Vec::new();
        }

        self.in_flight = None;
        self.summary = Some(summary.clone());
        self.status = SessionStatus::Done;
        vec![Effect::Finished { summary }]
    }

    fn on_abandoned(&mut self, call_id: u64, reason: String) -> Vec<Effect> {
        if self.in_flight.as_ref().map(Call::id) != Some(call_id) {
            debug!("Ignoring abandonment of call {call_id} that is not in flight");
            return Vec::new();
        }

        self.in_flight = None;
        self.status = SessionStatus::Failed {
            reason: reason.clone(),
        };

        let mut effects: Vec<Effect> = self
            .pending
            .drain(..)
            .map(|prompt| Effect::Redirect { prompt })
            .collect();
        effects.push(Effect::Abandoned { reason });
        effects
    }

    fn begin_generate(&mut self, prompt: String) -> Effect {
        let call_id = self.next_call_id();
        self.in_flight = Some(Call::Generate {
            call_id,
            prompt: prompt.clone(),
        });
        Effect::Generate {
            call_id,
            prompt,
            context: self.history.snapshot(),
        }
    }

    fn arm_timer(&mut self) -> Effect {
        self.timer_id += 1;
        Effect::ArmTimer {
            timer_id: self.timer_id,
            after: self.config.inactivity_timeout,
        }
    }

    fn next_call_id(&mut self) -> u64 {
        self.next_call_id += 1;
        self.next_call_id
    }

    #[must_use]
    pub fn accepts_prompts(&self) -> bool {
        self.status == SessionStatus::Active
    }

    #[must_use]
    pub const fn history(&self) -> &ConversationHistory {
        &self.history
    }

    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    #[must_use]
    pub const fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Prompts accepted but not yet sent to the gateway.
    #[must_use]
    pub fn pending_prompts(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            history: self.history.snapshot(),
            summary: self.summary.clone(),
            status: self.status.clone(),
        }
    }
}
