//! Event journals that make sessions recoverable.
//!
//! Each run of a session gets its own ordered log of [`SessionEvent`]s.
//! Replaying that log through [`crate::ConversationSession::replay`]
//! restores the committed state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::session::SessionEvent;

/// Identity of one run of a session. A session id gets a new run whenever a
/// prompt arrives after the previous run stopped taking prompts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId {
    pub session_id: String,
    pub run: u32,
}

impl RunId {
    pub fn new(session_id: impl Into<String>, run: u32) -> Self {
        Self {
            session_id: session_id.into(),
            run,
        }
    }

    #[must_use]
    pub fn next(&self) -> Self {
        Self::new(self.session_id.clone(), self.run + 1)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.run)
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventJournal: Send + Sync {
    async fn append(&self, run: &RunId, event: &SessionEvent) -> Result<(), JournalError>;

    async fn load(&self, run: &RunId) -> Result<Vec<SessionEvent>, JournalError>;

    /// Every run that has at least one event.
    async fn runs(&self) -> Result<Vec<RunId>, JournalError>;
}

/// Journal that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    runs: Mutex<HashMap<RunId, Vec<SessionEvent>>>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventJournal for MemoryJournal {
    async fn append(&self, run: &RunId, event: &SessionEvent) -> Result<(), JournalError> {
        self.runs
            .lock()
            .await
            .entry(run.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load(&self, run: &RunId) -> Result<Vec<SessionEvent>, JournalError> {
        Ok(self.runs.lock().await.get(run).cloned().unwrap_or_default())
    }

    async fn runs(&self) -> Result<Vec<RunId>, JournalError> {
        let mut runs: Vec<RunId> = self.runs.lock().await.keys().cloned().collect();
        runs.sort();
        Ok(runs)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    recorded_at: DateTime<Utc>,
    event: SessionEvent,
}

/// One JSON-lines file per run inside a directory.
///
/// File names are `<escaped session id>.<run>.jsonl`. A final line that
/// does not parse is treated as a torn write: `load` skips it and the next
/// `append` cuts it off before writing.
#[derive(Debug, Clone)]
pub struct FileJournal {
    dir: PathBuf,
}

impl FileJournal {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("Opened file journal at {}", dir.display());
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run: &RunId) -> PathBuf {
        self.dir
            .join(format!("{}.{}.jsonl", escape_id(&run.session_id), run.run))
    }
}

#[async_trait]
impl EventJournal for FileJournal {
    async fn append(&self, run: &RunId, event: &SessionEvent) -> Result<(), JournalError> {
        let record = JournalRecord {
            recorded_at: Utc::now(),
            event: event.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let path = self.path_for(run);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        let end = complete_len(&mut file).await?;
        if end < file.metadata().await?.len() {
            warn!("Cutting torn final journal line for {run}");
            file.set_len(end).await?;
        }
        file.seek(SeekFrom::Start(end)).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(&self, run: &RunId) -> Result<Vec<SessionEvent>, JournalError> {
        let content = match tokio::fs::read_to_string(self.path_for(run)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => events.push(record.event),
                Err(e) if i + 1 == lines.len() => {
                    warn!("Skipping torn final journal line for {run}: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(events)
    }

    async fn runs(&self) -> Result<Vec<RunId>, JournalError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(run) = parse_file_name(name) {
                runs.push(run);
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Length of the file up to and including its last newline.
async fn complete_len(file: &mut tokio::fs::File) -> Result<u64, JournalError> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(0);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    file.seek(SeekFrom::Start(0)).await?;
    let mut content = Vec::new();
    file.read_to_end(&mut content).await?;
    Ok(content
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i as u64 + 1))
}

fn escape_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn unescape_id(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn parse_file_name(name: &str) -> Option<RunId> {
    let stem = name.strip_suffix(".jsonl")?;
    let (escaped, run) = stem.rsplit_once('.')?;
    Some(RunId::new(unescape_id(escaped)?, run.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::{PromptSignal, SessionConfig};
    use std::time::Duration;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("chatflow-journal-{}", uuid::Uuid::now_v7()))
    }

    fn sample_events() -> Vec<SessionEvent> {
        vec![
            SessionEvent::Started {
                config: SessionConfig::new(Duration::from_secs(60)),
            },
            SessionEvent::PromptReceived {
                prompt: PromptSignal::new("hi").with_request_id("r1"),
            },
            SessionEvent::ReplyReceived {
                call_id: 1,
                reply: "hello".to_string(),
            },
        ]
    }

    #[test]
    fn session_ids_survive_file_name_escaping() {
        for id in ["chat-session-with-signals", "a/b c", "ünï.code#1", ""] {
            let run = RunId::new(id, 7);
            let name = format!("{}.{}.jsonl", escape_id(id), 7);
            assert_eq!(parse_file_name(&name), Some(run));
        }
        assert_eq!(parse_file_name("notes.txt"), None);
    }

    #[tokio::test]
    async fn memory_journal_keeps_runs_separate() {
        let journal = MemoryJournal::new();
        let first = RunId::new("s", 1);
        let second = first.next();

        for event in sample_events() {
            journal.append(&first, &event).await.unwrap();
        }
        journal.append(&second, &sample_events()[0]).await.unwrap();

        assert_eq!(journal.load(&first).await.unwrap(), sample_events());
        assert_eq!(journal.load(&second).await.unwrap().len(), 1);
        assert_eq!(journal.runs().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn file_journal_round_trips_and_lists_runs() {
        let dir = scratch_dir();
        let journal = FileJournal::open(&dir).await.unwrap();
        let run = RunId::new("chat/one", 2);

        for event in sample_events() {
            journal.append(&run, &event).await.unwrap();
        }

        let reopened = FileJournal::open(&dir).await.unwrap();
        assert_eq!(reopened.load(&run).await.unwrap(), sample_events());
        assert_eq!(reopened.runs().await.unwrap(), vec![run]);
        assert!(reopened.load(&RunId::new("missing", 1)).await.unwrap().is_empty());

        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn torn_final_line_is_skipped() {
        let dir = scratch_dir();
        let journal = FileJournal::open(&dir).await.unwrap();
        let run = RunId::new("s", 1);
        for event in sample_events() {
            journal.append(&run, &event).await.unwrap();
        }

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(journal.path_for(&run))
            .await
            .unwrap();
        file.write_all(b"{\"recorded_at\":\"2026-").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(journal.load(&run).await.unwrap(), sample_events());

        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn append_after_torn_line_keeps_journal_readable() {
        let dir = scratch_dir();
        let journal = FileJournal::open(&dir).await.unwrap();
        let run = RunId::new("s", 1);
        for event in sample_events() {
            journal.append(&run, &event).await.unwrap();
        }

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(journal.path_for(&run))
            .await
            .unwrap();
        file.write_all(b"{\"recorded_at\":\"2026-").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let later = [
            SessionEvent::PromptReceived {
                prompt: PromptSignal::new("after restart"),
            },
            SessionEvent::ReplyReceived {
                call_id: 2,
                reply: "welcome back".to_string(),
            },
        ];
        let reopened = FileJournal::open(&dir).await.unwrap();
        for event in &later {
            reopened.append(&run, event).await.unwrap();
        }

        let mut expected = sample_events();
        expected.extend(later);
        assert_eq!(reopened.load(&run).await.unwrap(), expected);

        let content = tokio::fs::read_to_string(journal.path_for(&run)).await.unwrap();
        assert_eq!(content.lines().count(), 5);
        assert!(content.ends_with('\n'));

        tokio::fs::remove_dir_all(dir).await.unwrap();
    }
}
