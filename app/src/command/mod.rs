//! Static strategy pattern for CLI commands.
//!
//! Each command is a separate strategy type with its own input, dispatched
//! statically from `main`.

use chatflow_config::Config;
use chatflow_conversation::{EventJournal, FileJournal, MemoryJournal};
use std::sync::Arc;
use tracing::info;

mod history;
mod init;
mod poll;
mod send;
mod version;
mod worker;

pub use history::{GetHistoryInput, GetHistoryStrategy};
pub use init::InitStrategy;
pub use poll::{PollInput, PollStrategy};
pub use send::{SendMessageInput, SendMessageStrategy};
pub use version::VersionStrategy;
pub use worker::WorkerStrategy;

/// Open the journal selected by `host.journal_dir`.
async fn open_journal(config: &Config) -> anyhow::Result<Arc<dyn EventJournal>> {
    match &config.host.journal_dir {
        Some(dir) => {
            info!("Journaling sessions to {}", dir.display());
            Ok(Arc::new(FileJournal::open(dir).await?))
        }
        None => {
            info!("No journal_dir configured, sessions live in memory only");
            Ok(Arc::new(MemoryJournal::new()))
        }
    }
}

/// Contract for all command strategies.
///
/// Each strategy defines its own input type, so parameters are passed
/// without runtime casting or boxing.
pub trait CommandStrategy: Send + Sync + 'static {
    type Input;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()>;
}
