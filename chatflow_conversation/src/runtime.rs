//! Drives one run of a [`ConversationSession`].
//!
//! The runtime owns the session and evaluates one event at a time: prompt
//! deliveries, call completions and the inactivity timer. Gateway calls run
//! on their own tasks with durable-call retries, so the session keeps
//! publishing committed snapshots to readers while a call is outstanding.

use chatflow_core::{
    CallRetryPolicy, ConversationEntry, InferenceGateway, PromptSignal, RetryExhausted,
    retry_with_backoff,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::journal::{EventJournal, RunId};
use crate::session::{ConversationSession, Effect, SessionEvent, SessionSnapshot, SessionStatus};

/// Reply to a prompt delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalAck {
    Accepted,
    /// The run no longer takes prompts; the prompt is handed back unprocessed.
    Redirected(PromptSignal),
}

/// A prompt on its way into a run, with the channel its ack goes back on.
#[derive(Debug)]
pub struct Delivery {
    pub prompt: PromptSignal,
    pub ack: oneshot::Sender<SignalAck>,
}

/// A prompt that a run accepted but could not process before it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub session_id: String,
    pub prompt: PromptSignal,
}

/// Collaborators shared by every run on a host.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub gateway: Arc<dyn InferenceGateway>,
    pub journal: Arc<dyn EventJournal>,
    pub retry: CallRetryPolicy,
    pub cancel: CancellationToken,
    pub redirects: mpsc::UnboundedSender<Redirect>,
    pub mailbox_capacity: usize,
}

enum CallRequest {
    Generate {
        prompt: String,
        context: Vec<ConversationEntry>,
    },
    Summarize {
        context: Vec<ConversationEntry>,
    },
}

/// Handle to a spawned run.
#[derive(Debug)]
pub struct SessionHandle {
    run_id: RunId,
    mailbox: mpsc::Sender<Delivery>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: Option<JoinHandle<SessionStatus>>,
}

impl SessionHandle {
    /// Start driving `session`, beginning with `effects`.
    #[must_use]
    pub fn spawn(
        run_id: RunId,
        session: ConversationSession,
        effects: Vec<Effect>,
        deps: &RuntimeDeps,
    ) -> Self {
        let (mailbox, deliveries) = mpsc::channel(deps.mailbox_capacity.max(1));
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot());
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let runtime = SessionRuntime {
            run_id: run_id.clone(),
            session,
            gateway: Arc::clone(&deps.gateway),
            journal: Arc::clone(&deps.journal),
            retry: deps.retry,
            cancel: deps.cancel.child_token(),
            snapshot: snapshot_tx,
            redirects: deps.redirects.clone(),
            completions_tx,
            deadline: None,
        };
        let task = tokio::spawn(runtime.run(deliveries, completions, effects));

        Self {
            run_id,
            mailbox,
            snapshot,
            task: Some(task),
        }
    }

    /// Handle for a run that has already finished, e.g. one recovered in a
    /// terminal state. It serves queries and redirects every prompt.
    #[must_use]
    pub fn finished(run_id: RunId, session: &ConversationSession) -> Self {
        let (mailbox, _) = mpsc::channel(1);
        let (_, snapshot) = watch::channel(session.snapshot());
        Self {
            run_id,
            mailbox,
            snapshot,
            task: None,
        }
    }

    #[must_use]
    pub const fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Deliver a prompt and wait for the run to accept or refuse it.
    pub async fn signal(&self, prompt: PromptSignal) -> SignalAck {
        let (ack, ack_rx) = oneshot::channel();
        let delivery = Delivery {
            prompt: prompt.clone(),
            ack,
        };
        if self.mailbox.send(delivery).await.is_err() {
            return SignalAck::Redirected(prompt);
        }
        ack_rx.await.unwrap_or(SignalAck::Redirected(prompt))
    }

    /// Last committed state. Never waits for an outstanding call.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait for the run's task to end. `None` for a handle with no task or a
    /// task that panicked.
    pub async fn join(mut self) -> Option<SessionStatus> {
        let task = self.task.take()?;
        match task.await {
            Ok(status) => Some(status),
            Err(e) => {
                error!("Session run {} ended abnormally: {e}", self.run_id);
                None
            }
        }
    }
}

struct SessionRuntime {
    run_id: RunId,
    session: ConversationSession,
    gateway: Arc<dyn InferenceGateway>,
    journal: Arc<dyn EventJournal>,
    retry: CallRetryPolicy,
    cancel: CancellationToken,
    snapshot: watch::Sender<SessionSnapshot>,
    redirects: mpsc::UnboundedSender<Redirect>,
    completions_tx: mpsc::UnboundedSender<SessionEvent>,
    deadline: Option<(u64, Instant)>,
}

impl SessionRuntime {
    async fn run(
        mut self,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut completions: mpsc::UnboundedReceiver<SessionEvent>,
        effects: Vec<Effect>,
    ) -> SessionStatus {
        info!("Session run {} started", self.run_id);
        let redirected = self.execute(effects);
        self.forward(redirected);

        let cancel = self.cancel.clone();
        while !self.session.status().is_terminal() {
            let timer = self.deadline.map(|(_, at)| at);

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("Session run {} cancelled", self.run_id);
                    break;
                }
                Some(delivery) = deliveries.recv() => {
                    self.deliver(delivery).await;
                }
                Some(event) = completions.recv() => {
                    let redirected = self.commit(event).await;
                    self.forward(redirected);
                }
                () = wait_until(timer) => {
                    self.timer_elapsed(&mut deliveries).await;
                }
            }
        }

        deliveries.close();
        while let Ok(delivery) = deliveries.try_recv() {
            let _ = delivery.ack.send(SignalAck::Redirected(delivery.prompt));
        }

        let status = self.session.status().clone();
        info!("Session run {} stopped: {status:?}", self.run_id);
        status
    }

    /// Prompts already queued when the timer fires are delivered first, so
    /// the timeout only takes effect if the session is still idle after them.
    async fn timer_elapsed(&mut self, deliveries: &mut mpsc::Receiver<Delivery>) {
        let Some((timer_id, _)) = self.deadline.take() else {
            return;
        };
        while let Ok(delivery) = deliveries.try_recv() {
            self.deliver(delivery).await;
        }
        debug!("Inactivity timer {timer_id} elapsed for {}", self.run_id);
        let redirected = self
            .commit(SessionEvent::InactivityElapsed { timer_id })
            .await;
        self.forward(redirected);
    }

    async fn deliver(&mut self, delivery: Delivery) {
        let Delivery { prompt, ack } = delivery;
        if !self.session.accepts_prompts() {
            debug!("Run {} refused prompt after it stopped", self.run_id);
            let _ = ack.send(SignalAck::Redirected(prompt));
            return;
        }

        info!("Run {} received prompt ({} chars)", self.run_id, prompt.text.len());
        let redirected = self
            .commit(SessionEvent::PromptReceived { prompt })
            .await;
        let _ = ack.send(SignalAck::Accepted);
        self.forward(redirected);
    }

    /// Journal the event, fold it into the session, publish the new state
    /// and carry out the resulting effects.
    async fn commit(&mut self, event: SessionEvent) -> Vec<PromptSignal> {
        if let Err(e) = self.journal.append(&self.run_id, &event).await {
            error!("Failed to journal event for {}: {e}", self.run_id);
        }
        let effects = self.session.apply(event);
        self.snapshot.send_replace(self.session.snapshot());
        self.execute(effects)
    }

    fn execute(&mut self, effects: Vec<Effect>) -> Vec<PromptSignal> {
        let mut redirected = Vec::new();
        for effect in effects {
            match effect {
                Effect::Generate {
                    call_id,
                    prompt,
                    context,
                } => self.spawn_call(call_id, CallRequest::Generate { prompt, context }),
                Effect::Summarize { call_id, context } => {
                    info!("Session {} is inactive, requesting summary", self.run_id);
                    self.spawn_call(call_id, CallRequest::Summarize { context });
                }
                Effect::ArmTimer { timer_id, after } => {
                    self.deadline = Some((timer_id, Instant::now() + after));
                }
                Effect::Redirect { prompt } => redirected.push(prompt),
                Effect::Finished { summary } => {
                    info!(
                        "Session {} finished, summary of {} chars",
                        self.run_id,
                        summary.len()
                    );
                }
                Effect::Abandoned { reason } => {
                    error!("Session {} abandoned: {reason}", self.run_id);
                }
            }
        }
        redirected
    }

    fn forward(&self, redirected: Vec<PromptSignal>) {
        for prompt in redirected {
            let redirect = Redirect {
                session_id: self.run_id.session_id.clone(),
                prompt,
            };
            if self.redirects.send(redirect).is_err() {
                warn!("Dropping prompt for {}: host is gone", self.run_id);
            }
        }
    }

    fn spawn_call(&self, call_id: u64, request: CallRequest) {
        let gateway = Arc::clone(&self.gateway);
        let retry = self.retry;
        let cancel = self.cancel.child_token();
        let completions = self.completions_tx.clone();
        let run_id = self.run_id.clone();

        tokio::spawn(async move {
            let result = match &request {
                CallRequest::Generate { prompt, context } => {
                    retry_with_backoff(|| gateway.generate(prompt, context), &retry, &cancel).await
                }
                CallRequest::Summarize { context } => {
                    retry_with_backoff(|| gateway.summarize(context), &retry, &cancel).await
                }
            };

            let event = match (result, request) {
                (Ok(reply), CallRequest::Generate { .. }) => {
                    SessionEvent::ReplyReceived { call_id, reply }
                }
                (Ok(summary), CallRequest::Summarize { .. }) => {
                    SessionEvent::SummaryReceived { call_id, summary }
                }
                (Err(RetryExhausted::Cancelled { attempts }), _) => {
                    debug!("Call {call_id} for {run_id} cancelled after {attempts} attempts");
                    return;
                }
                (Err(e), _) => {
                    warn!("Call {call_id} for {run_id} failed permanently: {e}");
                    SessionEvent::CallAbandoned {
                        call_id,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = completions.send(event);
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use async_trait::async_trait;
    use chatflow_core::{CallError, SessionConfig};
    use std::time::Duration;

    struct EchoGateway;

    #[async_trait]
    impl InferenceGateway for EchoGateway {
        async fn generate(
            &self,
            prompt: &str,
            _context: &[ConversationEntry],
        ) -> Result<String, CallError> {
            Ok(format!("echo: {prompt}"))
        }

        async fn summarize(&self, context: &[ConversationEntry]) -> Result<String, CallError> {
            Ok(format!("{} entries", context.len()))
        }
    }

    fn idle_runtime() -> (SessionRuntime, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session, effects) = ConversationSession::start(SessionConfig::new(Duration::ZERO));
        let (snapshot, _) = watch::channel(session.snapshot());
        let (redirects, _) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let mut runtime = SessionRuntime {
            run_id: RunId::new("s", 1),
            session,
            gateway: Arc::new(EchoGateway),
            journal: Arc::new(MemoryJournal::new()),
            retry: CallRetryPolicy::default(),
            cancel: CancellationToken::new(),
            snapshot,
            redirects,
            completions_tx,
            deadline: None,
        };
        runtime.execute(effects);
        (runtime, completions)
    }

    #[tokio::test]
    async fn queued_prompt_is_delivered_before_due_timer() {
        let (mut runtime, mut completions) = idle_runtime();
        assert!(runtime.deadline.is_some());

        let (mailbox, mut deliveries) = mpsc::channel(4);
        let (ack, ack_rx) = oneshot::channel();
        mailbox
            .try_send(Delivery {
                prompt: PromptSignal::new("just in time"),
                ack,
            })
            .unwrap();

        runtime.timer_elapsed(&mut deliveries).await;

        assert_eq!(ack_rx.await.unwrap(), SignalAck::Accepted);
        assert_eq!(runtime.session.status(), &SessionStatus::Active);

        let reply = completions.recv().await.unwrap();
        assert!(matches!(
            &reply,
            SessionEvent::ReplyReceived { reply, .. } if reply == "echo: just in time"
        ));
        runtime.commit(reply).await;
        assert_eq!(runtime.session.history().len(), 2);
        assert!(runtime.deadline.is_some());
    }

    #[tokio::test]
    async fn due_timer_with_empty_mailbox_starts_summary() {
        let (mut runtime, mut completions) = idle_runtime();
        let (_mailbox, mut deliveries) = mpsc::channel(4);

        runtime.timer_elapsed(&mut deliveries).await;

        assert_eq!(runtime.session.status(), &SessionStatus::Summarizing);
        let summary = completions.recv().await.unwrap();
        runtime.commit(summary).await;
        assert_eq!(runtime.session.status(), &SessionStatus::Done);
        assert_eq!(runtime.session.summary(), Some("0 entries"));
    }
}
