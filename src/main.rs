//! imap-relay CLI: copy mail between IMAP accounts.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use imap_relay::config::{load_account, SyncRequest, DESTINATION_PASSWORD_ENV, SOURCE_PASSWORD_ENV};
use imap_relay::progress::LogEntry;
use imap_relay::{
    empty_account, probe, request_stop, start_sync, AsyncImapConnector, InMemoryProgressStore, ProgressStore,
    SyncError, SyncOutcome,
};

#[derive(Parser)]
#[command(name = "imap-relay", version, about = "Copy mail from one IMAP account to another")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy mailboxes from the source account to the destination account.
    Sync {
        /// JSON file with `source`, `destination` and optional `options`.
        #[arg(long)]
        request: PathBuf,

        /// Session id for the run; generated when omitted.
        #[arg(long)]
        session_id: Option<String>,

        /// Seconds between progress polls.
        #[arg(long, default_value = "1")]
        poll_interval: u64,
    },

    /// Log in to one account and list its folders.
    Test {
        /// JSON file with the account's connection settings.
        #[arg(long)]
        config: PathBuf,
    },

    /// Delete every message in every folder of one account.
    Empty {
        /// JSON file with the account's connection settings.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Sync {
            request,
            session_id,
            poll_interval,
        } => run_sync(request, session_id, Duration::from_secs(poll_interval.max(1))).await,
        Commands::Test { config } => run_test(config).await,
        Commands::Empty { config } => run_empty(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_sync(path: PathBuf, session_id: Option<String>, poll: Duration) -> Result<ExitCode, SyncError> {
    let request = SyncRequest::from_file(&path)?;
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let store: Arc<dyn ProgressStore> = Arc::new(InMemoryProgressStore::new());

    let mut handle = start_sync(
        session_id.clone(),
        request.source,
        request.destination,
        request.options,
        Arc::new(AsyncImapConnector),
        Arc::clone(&store),
    )?;
    println!("Started sync session {session_id}");

    let mut last_log = None;
    let mut ticker = tokio::time::interval(poll);
    let report = loop {
        tokio::select! {
            joined = &mut handle => {
                break joined.map_err(|e| SyncError::Message(format!("Sync task failed: {e}")))?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping after the current message...");
                if let Err(e) = request_stop(store.as_ref(), &session_id) {
                    log::warn!("Could not request stop: {e}");
                }
            }
            _ = ticker.tick() => {
                last_log = print_new_logs(store.as_ref(), &session_id, last_log);
            }
        }
    };
    print_new_logs(store.as_ref(), &session_id, last_log);

    let stats = &report.stats;
    println!(
        "{} mailboxes, {} synced, {} skipped, {} errors in {}s",
        stats.processed_mailboxes,
        stats.synced_emails,
        stats.skipped_emails,
        stats.errors.len(),
        stats.elapsed_seconds
    );
    for error in &stats.errors {
        println!("  {error}");
    }

    Ok(match report.outcome {
        SyncOutcome::Completed | SyncOutcome::Stopped => ExitCode::SUCCESS,
        SyncOutcome::CompletedWithErrors => ExitCode::from(2),
        SyncOutcome::Failed => ExitCode::FAILURE,
    })
}

/// Print log lines published after `last`. Returns the newest line seen.
fn print_new_logs(store: &dyn ProgressStore, session_id: &str, last: Option<LogEntry>) -> Option<LogEntry> {
    let record = match store.get(session_id) {
        Ok(Some(record)) => record,
        Ok(None) => return last,
        Err(e) => {
            log::warn!("Could not read progress: {e}");
            return last;
        }
    };

    // Only a bounded tail is kept; if `last` has scrolled out, print the whole tail.
    let start = last
        .as_ref()
        .and_then(|seen| record.logs.iter().rposition(|entry| entry == seen))
        .map_or(0, |i| i + 1);
    for entry in &record.logs[start..] {
        println!(
            "[{:>3}%] {} {}",
            record.percentage,
            entry.timestamp.format("%H:%M:%S"),
            entry.message
        );
    }
    record.logs.last().cloned().or(last)
}

async fn run_test(path: PathBuf) -> Result<ExitCode, SyncError> {
    let config = load_account(&path, SOURCE_PASSWORD_ENV)?;
    let report = probe(&AsyncImapConnector, &config).await?;
    println!("{}", report.summary());
    for mailbox in &report.mailboxes {
        println!("  {}", mailbox.path);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_empty(path: PathBuf) -> Result<ExitCode, SyncError> {
    let config = load_account(&path, DESTINATION_PASSWORD_ENV)?;
    let emptied = empty_account(&AsyncImapConnector, &config).await?;
    println!("Emptied {} folder(s)", emptied.len());
    for path in &emptied {
        println!("  {path}");
    }
    Ok(ExitCode::SUCCESS)
}
