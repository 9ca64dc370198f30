//! Hosts conversation sessions by id and routes signals and queries to them.
//!
//! The host is constructed once per process and passed to whoever needs it.
//! Every request goes through [`SessionHost::dispatch`].

use chatflow_core::{
    CallRetryPolicy, ConversationEntry, InferenceGateway, PromptSignal, SessionConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::journal::{EventJournal, JournalError, RunId};
use crate::runtime::{Redirect, RuntimeDeps, SessionHandle, SignalAck};
use crate::session::{ConversationSession, SessionEvent, SessionSnapshot, SessionStatus};

/// Attempts at delivering one prompt when runs keep closing underneath it.
const MAX_DELIVERY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub session: SessionConfig,
    pub retry: CallRetryPolicy,
    pub mailbox_capacity: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            retry: CallRetryPolicy::default(),
            mailbox_capacity: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("session {0} did not accept the prompt")]
    Unavailable(String),

    #[error("host is shut down")]
    ShutDown,

    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionQuery {
    History,
    Summary,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    /// Deliver a prompt, starting the session first if it does not exist.
    SignalWithStart {
        session_id: String,
        prompt: PromptSignal,
    },
    /// Read committed state. `run: None` addresses the latest run.
    Query {
        session_id: String,
        run: Option<u32>,
        query: SessionQuery,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostResponse {
    Signalled {
        run: RunId,
    },
    History {
        entries: Vec<ConversationEntry>,
    },
    Summary {
        summary: Option<String>,
    },
    Status {
        run: RunId,
        status: SessionStatus,
    },
}

/// Every run of one session id. Prompts go to `current`; older runs stay
/// queryable and may still be finishing their summary.
struct SessionRuns {
    current: SessionHandle,
    superseded: Vec<SessionHandle>,
}

impl SessionRuns {
    fn new(current: SessionHandle) -> Self {
        Self {
            current,
            superseded: Vec::new(),
        }
    }

    fn find(&self, run: u32) -> Option<&SessionHandle> {
        if self.current.run_id().run == run {
            return Some(&self.current);
        }
        self.superseded.iter().find(|h| h.run_id().run == run)
    }

    fn supersede(&mut self, next: SessionHandle) {
        let previous = std::mem::replace(&mut self.current, next);
        self.superseded.push(previous);
    }

    fn into_handles(self) -> impl Iterator<Item = SessionHandle> {
        self.superseded.into_iter().chain(std::iter::once(self.current))
    }
}

/// Per-session lock. Empty until the first run has been journaled.
type SessionSlot = Arc<Mutex<Option<SessionRuns>>>;

struct HostInner {
    deps: RuntimeDeps,
    settings: HostSettings,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

/// Cheap-to-clone handle to the process's session host.
#[derive(Clone)]
pub struct SessionHost {
    inner: Arc<HostInner>,
}

impl SessionHost {
    /// Create a host. Must be called inside a tokio runtime.
    pub fn new(
        gateway: Arc<dyn InferenceGateway>,
        journal: Arc<dyn EventJournal>,
        settings: HostSettings,
    ) -> Self {
        let (redirects, redirected) = mpsc::unbounded_channel();
        let deps = RuntimeDeps {
            gateway,
            journal,
            retry: settings.retry,
            cancel: CancellationToken::new(),
            redirects,
            mailbox_capacity: settings.mailbox_capacity,
        };
        let host = Self {
            inner: Arc::new(HostInner {
                deps,
                settings,
                sessions: Mutex::new(HashMap::new()),
            }),
        };

        tokio::spawn(route_redirects(
            Arc::downgrade(&host.inner),
            redirected,
            host.inner.deps.cancel.clone(),
        ));
        host
    }

    /// Rebuild every journaled session.
    ///
    /// Runs that were still active or summarizing resume their outstanding
    /// call or timer. A run whose journal cannot be read or replayed is
    /// skipped. Returns how many sessions were restored.
    pub async fn recover(&self) -> Result<usize, HostError> {
        let journal = &self.inner.deps.journal;
        let mut by_session: HashMap<String, Vec<RunId>> = HashMap::new();
        for run in journal.runs().await? {
            by_session.entry(run.session_id.clone()).or_default().push(run);
        }

        let mut restored = 0;
        let mut sessions = self.inner.sessions.lock().await;
        for (session_id, mut run_ids) in by_session {
            run_ids.sort();
            let mut runs: Option<SessionRuns> = None;
            for run_id in run_ids {
                let Some(handle) = self.restore_run(&run_id).await else {
                    continue;
                };
                runs = Some(match runs.take() {
                    Some(mut older) => {
                        older.supersede(handle);
                        older
                    }
                    None => SessionRuns::new(handle),
                });
            }
            if runs.is_some() {
                sessions.insert(session_id, Arc::new(Mutex::new(runs)));
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Single entry point for signals and queries.
    pub async fn dispatch(&self, request: HostRequest) -> Result<HostResponse, HostError> {
        match request {
            HostRequest::SignalWithStart { session_id, prompt } => {
                let run = self.signal_with_start(&session_id, prompt).await?;
                Ok(HostResponse::Signalled { run })
            }
            HostRequest::Query {
                session_id,
                run,
                query,
            } => self.query(&session_id, run, query).await,
        }
    }

    /// Deliver `prompt` to the current run of `session_id`, starting a run
    /// when there is none and a fresh one when the current run has stopped
    /// taking prompts.
    pub async fn signal_with_start(
        &self,
        session_id: &str,
        prompt: PromptSignal,
    ) -> Result<RunId, HostError> {
        if self.inner.deps.cancel.is_cancelled() {
            return Err(HostError::ShutDown);
        }

        // Held across delivery so prompts for one session keep the order in
        // which callers got here. Other sessions are not blocked.
        let slot = self.slot_or_insert(session_id).await;
        let mut slot = slot.lock().await;
        if slot.is_none() {
            let handle = self.start_run(RunId::new(session_id, 1)).await?;
            *slot = Some(SessionRuns::new(handle));
        }
        let Some(runs) = slot.as_mut() else {
            return Err(HostError::SessionNotFound(session_id.to_string()));
        };

        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            if self.inner.deps.cancel.is_cancelled() {
                return Err(HostError::ShutDown);
            }

            let run_id = runs.current.run_id().clone();
            match runs.current.signal(prompt.clone()).await {
                SignalAck::Accepted => {
                    debug!("Prompt accepted by {run_id}");
                    return Ok(run_id);
                }
                SignalAck::Redirected(_) => {
                    info!("Run {run_id} stopped taking prompts, starting a new run");
                    let next = self.start_run(run_id.next()).await?;
                    runs.supersede(next);
                }
            }
        }
        Err(HostError::Unavailable(session_id.to_string()))
    }

    pub async fn query(
        &self,
        session_id: &str,
        run: Option<u32>,
        query: SessionQuery,
    ) -> Result<HostResponse, HostError> {
        let (run, snapshot) = self.resolve(session_id, run).await?;
        Ok(match query {
            SessionQuery::History => HostResponse::History {
                entries: snapshot.history,
            },
            SessionQuery::Summary => HostResponse::Summary {
                summary: snapshot.summary,
            },
            SessionQuery::Status => HostResponse::Status {
                run,
                status: snapshot.status,
            },
        })
    }

    /// Committed state of the latest run of `session_id`.
    pub async fn snapshot(&self, session_id: &str) -> Result<(RunId, SessionSnapshot), HostError> {
        self.resolve(session_id, None).await
    }

    /// Committed state of one specific run, including superseded ones.
    pub async fn run_snapshot(&self, run: &RunId) -> Result<SessionSnapshot, HostError> {
        let (_, snapshot) = self.resolve(&run.session_id, Some(run.run)).await?;
        Ok(snapshot)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let slots: Vec<(String, SessionSlot)> = self
            .inner
            .sessions
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut ids = Vec::with_capacity(slots.len());
        for (id, slot) in slots {
            if slot.lock().await.is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    /// Stop every run, superseded ones included. Committed history and
    /// summaries are left as they are.
    pub async fn shutdown(&self) {
        info!("Shutting down session host");
        self.inner.deps.cancel.cancel();
        let slots: Vec<SessionSlot> = self
            .inner
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            let Some(runs) = slot.lock().await.take() else {
                continue;
            };
            for handle in runs.into_handles() {
                handle.join().await;
            }
        }
    }

    async fn slot(&self, session_id: &str) -> Option<SessionSlot> {
        self.inner.sessions.lock().await.get(session_id).cloned()
    }

    async fn slot_or_insert(&self, session_id: &str) -> SessionSlot {
        let mut sessions = self.inner.sessions.lock().await;
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    async fn resolve(
        &self,
        session_id: &str,
        run: Option<u32>,
    ) -> Result<(RunId, SessionSnapshot), HostError> {
        let not_found = || HostError::SessionNotFound(session_id.to_string());
        let slot = self.slot(session_id).await.ok_or_else(not_found)?;
        let slot = slot.lock().await;
        let runs = slot.as_ref().ok_or_else(not_found)?;
        let handle = match run {
            None => &runs.current,
            Some(run) => runs
                .find(run)
                .ok_or_else(|| HostError::RunNotFound(RunId::new(session_id, run)))?,
        };
        Ok((handle.run_id().clone(), handle.snapshot()))
    }

    async fn restore_run(&self, run_id: &RunId) -> Option<SessionHandle> {
        let events = match self.inner.deps.journal.load(run_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Skipping run {run_id}, journal unreadable: {e}");
                return None;
            }
        };
        let session = match ConversationSession::replay(events) {
            Ok(session) => session,
            Err(e) => {
                warn!("Skipping unrecoverable run {run_id}: {e}");
                return None;
            }
        };

        info!("Recovered session run {run_id}");
        if session.status().is_terminal() {
            Some(SessionHandle::finished(run_id.clone(), &session))
        } else {
            let effects = session.resume_effects();
            Some(SessionHandle::spawn(
                run_id.clone(),
                session,
                effects,
                &self.inner.deps,
            ))
        }
    }

    async fn start_run(&self, run_id: RunId) -> Result<SessionHandle, HostError> {
        let config = self.inner.settings.session;
        let (session, effects) = ConversationSession::start(config);
        self.inner
            .deps
            .journal
            .append(&run_id, &SessionEvent::Started { config })
            .await?;
        info!("Starting session run {run_id}");
        Ok(SessionHandle::spawn(run_id, session, effects, &self.inner.deps))
    }
}

async fn route_redirects(
    host: Weak<HostInner>,
    mut redirected: mpsc::UnboundedReceiver<Redirect>,
    cancel: CancellationToken,
) {
    loop {
        let redirect = tokio::select! {
            () = cancel.cancelled() => break,
            redirect = redirected.recv() => match redirect {
                Some(redirect) => redirect,
                None => break,
            },
        };

        let Some(inner) = host.upgrade() else { break };
        let host = SessionHost { inner };
        info!("Redirecting queued prompt to a new run of {}", redirect.session_id);
        if let Err(e) = host
            .signal_with_start(&redirect.session_id, redirect.prompt)
            .await
        {
            warn!("Failed to redirect prompt for {}: {e}", redirect.session_id);
        }
    }
}
