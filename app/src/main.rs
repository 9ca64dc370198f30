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

mod client;
mod command;
mod server;

use clap::{Parser, Subcommand};
use command::{
    CommandStrategy, GetHistoryInput, GetHistoryStrategy, InitStrategy, PollInput, PollStrategy,
    SendMessageInput, SendMessageStrategy, VersionStrategy, WorkerStrategy,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Session id used when none is given on the command line.
pub const DEFAULT_SESSION_ID: &str = "chat-session-with-signals";

#[derive(Parser)]
#[command(name = "chatflow")]
#[command(about = "Signal-driven chat sessions and resilient polling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session host and serve it over HTTP
    Worker,
    /// Send a prompt to a session, starting it if needed
    SendMessage {
        /// Prompt text
        prompt: String,

        /// Session to deliver to
        #[arg(short, long, default_value = DEFAULT_SESSION_ID)]
        session: String,

        /// Id used to drop redelivered copies of this prompt
        #[arg(short, long)]
        request_id: Option<String>,
    },
    /// Print a session's conversation history and summary
    GetHistory {
        /// Session to read
        #[arg(short, long, default_value = DEFAULT_SESSION_ID)]
        session: String,
    },
    /// Poll the simulated test service until it answers
    Poll {
        /// Give up after this many seconds
        #[arg(short, long)]
        deadline_secs: Option<u64>,

        /// Outages before the service answers
        #[arg(short, long)]
        failures: Option<u32>,
    },
    /// Initialize configuration
    Init,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker => WorkerStrategy.execute(()).await,
        Commands::SendMessage {
            prompt,
            session,
            request_id,
        } => {
            SendMessageStrategy
                .execute(SendMessageInput {
                    prompt,
                    session,
                    request_id,
                })
                .await
        }
        Commands::GetHistory { session } => {
            GetHistoryStrategy
                .execute(GetHistoryInput { session })
                .await
        }
        Commands::Poll {
            deadline_secs,
            failures,
        } => {
            PollStrategy
                .execute(PollInput {
                    deadline_secs,
                    failures,
                })
                .await
        }
        Commands::Init => InitStrategy.execute(()).await,
        Commands::Version => VersionStrategy.execute(()).await,
    }
}
