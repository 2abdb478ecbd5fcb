//! Drives one sync run from connect to finalize.
//!
//! Mailboxes and messages are processed strictly one at a time over a single
//! source and a single destination session. Whatever happens inside the run,
//! opened sessions are logged out and exactly one final update marks the
//! record complete.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::connection::SessionPair;
use super::enumerate::list_mailboxes;
use super::options::{validate_config, SyncOptions};
use super::tracker::{
    mailbox_percentage, message_percentage, message_update_due, ProgressTracker, CONNECTED_PERCENTAGE,
};
use super::transfer::{self, MessageOutcome};
use crate::error::{SyncError, SyncResult};
use crate::imap::{Connector, ImapConfig, MailboxInfo};
use crate::progress::{MailboxStat, Phase, ProgressStore, ProgressUpdate, SyncOutcome};

/// Counters accumulated over a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total_mailboxes: u32,
    pub processed_mailboxes: u32,
    /// Sum of the working-set sizes of the mailboxes started so far.
    pub total_emails: u64,
    pub synced_emails: u64,
    pub skipped_emails: u64,
    pub errors: Vec<String>,
    pub mailboxes: Vec<MailboxStat>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
}

impl RunStats {
    fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total_mailboxes: 0,
            processed_mailboxes: 0,
            total_emails: 0,
            synced_emails: 0,
            skipped_emails: 0,
            errors: Vec::new(),
            mailboxes: Vec::new(),
            start_time,
            end_time: None,
            elapsed_seconds: 0,
        }
    }

    pub fn processed_emails(&self) -> u64 {
        self.synced_emails + self.skipped_emails
    }
}

/// What a finished run hands back to whoever awaited it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub session_id: String,
    pub outcome: SyncOutcome,
    pub stats: RunStats,
    /// The error that ended the run early, if any.
    pub fatal_error: Option<String>,
    /// Set when the progress store failed at least once during the run;
    /// observers may then have missed updates.
    pub store_error: Option<String>,
}

/// How the run body ended before finalization.
enum Ending {
    Finished,
    Stopped,
}

/// One mailbox's result as seen by the run loop.
struct MailboxRun {
    stat: MailboxStat,
    stopped: bool,
}

pub struct SyncEngine<C, S>
where
    C: Connector,
    S: ProgressStore + ?Sized,
{
    session_id: String,
    source: ImapConfig,
    destination: ImapConfig,
    options: SyncOptions,
    connector: Arc<C>,
    store: Arc<S>,
}

impl<C, S> SyncEngine<C, S>
where
    C: Connector,
    S: ProgressStore + ?Sized,
{
    pub fn new(
        session_id: impl Into<String>,
        source: ImapConfig,
        destination: ImapConfig,
        options: SyncOptions,
        connector: Arc<C>,
        store: Arc<S>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            source,
            destination,
            options,
            connector,
            store,
        }
    }

    /// Run to completion. Never fails: every ending is expressed in the
    /// returned report and in the final progress update.
    pub async fn run(self) -> SyncReport {
        let started = Utc::now();
        let mut tracker = ProgressTracker::new(Arc::clone(&self.store), &self.session_id);
        let mut stats = RunStats::new(started);

        log::info!(
            "Starting sync session {} from {} to {}",
            self.session_id,
            self.source.label(),
            self.destination.label()
        );
        tracker.publish(ProgressUpdate {
            percentage: Some(0),
            phase: Some(Phase::Start),
            start_time: Some(started),
            ..ProgressUpdate::log("Starting email sync")
        });

        let mut sessions = SessionPair::new();
        let body = std::panic::AssertUnwindSafe(self.drive(&mut sessions, &mut tracker, &mut stats))
            .catch_unwind()
            .await;

        sessions.shutdown().await;

        let result = match body {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("Sync session {} panicked: {reason}", self.session_id);
                Err(SyncError::Message(format!("Sync aborted unexpectedly: {reason}")))
            }
        };

        self.finalize(&mut tracker, stats, result)
    }

    async fn drive(
        &self,
        sessions: &mut SessionPair<C::Session>,
        tracker: &mut ProgressTracker<S>,
        stats: &mut RunStats,
    ) -> SyncResult<Ending> {
        tracker.publish(ProgressUpdate {
            phase: Some(Phase::Running),
            ..ProgressUpdate::log("Connecting to source and destination servers")
        });
        sessions
            .connect(self.connector.as_ref(), &self.source, &self.destination)
            .await?;

        let listing = list_mailboxes(sessions.source_mut()?, self.options.max_mailboxes).await?;
        let found = if listing.is_capped() {
            format!(
                "Found {} mailboxes, processing the first {}",
                listing.discovered,
                listing.mailboxes.len()
            )
        } else {
            format!("Found {} mailboxes", listing.mailboxes.len())
        };
        let mailboxes = listing.mailboxes;
        stats.total_mailboxes = mailboxes.len() as u32;
        tracker.publish(ProgressUpdate {
            percentage: Some(CONNECTED_PERCENTAGE),
            total_mailboxes: Some(stats.total_mailboxes),
            total_messages: Some(0),
            ..ProgressUpdate::log(found)
        });

        for (index, mailbox) in mailboxes.iter().enumerate() {
            if tracker.stop_requested() {
                log::info!("Stop requested before mailbox {}", mailbox.path);
                return Ok(Ending::Stopped);
            }

            tracker.publish(ProgressUpdate {
                current_mailbox: Some(mailbox.path.clone()),
                processed_mailboxes: Some(stats.processed_mailboxes),
                ..ProgressUpdate::log(format!(
                    "Processing mailbox: {} ({}/{})",
                    mailbox.path,
                    index + 1,
                    mailboxes.len()
                ))
            });

            match self.sync_mailbox(sessions, tracker, stats, mailbox).await {
                Ok(MailboxRun { stat, stopped }) => {
                    stats.processed_mailboxes += 1;
                    stats.mailboxes.push(stat.clone());

                    let percentage = if stats.total_emails > 0 {
                        message_percentage(stats.processed_emails(), stats.total_emails)
                    } else {
                        mailbox_percentage(index, mailboxes.len())
                    };
                    let line = if stopped {
                        format!(
                            "Stopped in mailbox {} after {} of its messages",
                            stat.name,
                            stat.processed()
                        )
                    } else {
                        format!(
                            "Completed mailbox {}: {} synced, {} skipped",
                            stat.name, stat.synced_messages, stat.skipped_messages
                        )
                    };
                    tracker.publish(ProgressUpdate {
                        percentage: Some(percentage),
                        processed_mailboxes: Some(stats.processed_mailboxes),
                        processed_messages: Some(stats.processed_emails()),
                        total_messages: Some(stats.total_emails),
                        mailbox_summaries: vec![stat],
                        ..ProgressUpdate::log(line)
                    });

                    if stopped {
                        return Ok(Ending::Stopped);
                    }
                }
                Err(e) => {
                    log::error!("{e}");
                    stats.errors.push(e.to_string());
                    let percentage = if stats.total_emails > 0 {
                        None
                    } else {
                        Some(mailbox_percentage(index, mailboxes.len()))
                    };
                    tracker.publish(ProgressUpdate {
                        percentage,
                        ..ProgressUpdate::log(e.to_string())
                    });
                }
            }
        }

        Ok(Ending::Finished)
    }

    async fn sync_mailbox(
        &self,
        sessions: &mut SessionPair<C::Session>,
        tracker: &mut ProgressTracker<S>,
        stats: &mut RunStats,
        mailbox: &MailboxInfo,
    ) -> SyncResult<MailboxRun> {
        let (source, destination) = sessions.both_mut()?;
        let prepared = transfer::prepare(source, destination, &mailbox.path, &self.options).await?;

        let mut stat = MailboxStat::new(&mailbox.path);
        stat.total_messages = prepared.refs.len() as u64;
        if prepared.refs.is_empty() {
            log::info!("Mailbox {} is empty", mailbox.path);
            return Ok(MailboxRun { stat, stopped: false });
        }

        stats.total_emails += stat.total_messages;
        tracker.publish(ProgressUpdate {
            total_messages: Some(stats.total_emails),
            ..ProgressUpdate::log(format!(
                "Found {} messages in {}, syncing {}",
                prepared.server_count, mailbox.path, stat.total_messages
            ))
        });
        if prepared.sequence_fallback {
            tracker.publish(ProgressUpdate::log(format!(
                "SEARCH unavailable in {}, addressing messages by sequence number",
                mailbox.path
            )));
        }

        let interval = self.options.publish_interval();
        for batch in prepared.refs.chunks(self.options.batch_size as usize) {
            for reference in batch {
                if tracker.stop_requested() {
                    let unprocessed = stat.total_messages - stat.processed();
                    stats.total_emails -= unprocessed;
                    stat.total_messages = stat.processed();
                    log::info!("Stop requested in mailbox {} before {reference}", mailbox.path);
                    return Ok(MailboxRun { stat, stopped: true });
                }

                let outcome =
                    transfer::transfer_message(source, destination, &prepared, *reference, &self.options).await;
                let synced = outcome.is_synced();
                match outcome {
                    MessageOutcome::Synced { .. } => {
                        stat.synced_messages += 1;
                        stats.synced_emails += 1;
                    }
                    MessageOutcome::SkippedEmpty | MessageOutcome::SkippedExisting => {
                        stat.skipped_messages += 1;
                        stats.skipped_emails += 1;
                    }
                    MessageOutcome::Failed { error } => {
                        stat.skipped_messages += 1;
                        stats.skipped_emails += 1;
                        stats.errors.push(error);
                    }
                }

                let heartbeat = synced && stats.synced_emails % 5 == 0;
                if message_update_due(
                    stats.processed_emails(),
                    interval,
                    stat.processed(),
                    stat.total_messages,
                    heartbeat,
                ) {
                    tracker.publish(ProgressUpdate {
                        percentage: Some(message_percentage(stats.processed_emails(), stats.total_emails)),
                        processed_messages: Some(stats.processed_emails()),
                        total_messages: Some(stats.total_emails),
                        ..ProgressUpdate::log(format!(
                            "Processing messages: {}/{} (mailbox: {})",
                            stats.processed_emails(),
                            stats.total_emails,
                            mailbox.path
                        ))
                    });
                }
            }
            log::debug!("Finished a batch of {} messages in {}", batch.len(), mailbox.path);
        }

        Ok(MailboxRun { stat, stopped: false })
    }

    fn finalize(
        &self,
        tracker: &mut ProgressTracker<S>,
        mut stats: RunStats,
        result: SyncResult<Ending>,
    ) -> SyncReport {
        let ended = Utc::now();
        stats.end_time = Some(ended);
        stats.elapsed_seconds = (ended - stats.start_time).num_seconds().max(0) as u64;

        let (outcome, fatal_error) = match result {
            Ok(Ending::Finished) if stats.errors.is_empty() => (SyncOutcome::Completed, None),
            Ok(Ending::Finished) => (SyncOutcome::CompletedWithErrors, None),
            Ok(Ending::Stopped) => (SyncOutcome::Stopped, None),
            Err(e) => {
                stats.errors.push(e.to_string());
                (SyncOutcome::Failed, Some(e.to_string()))
            }
        };

        let totals = format!(
            "Synced {} messages, skipped {} messages across {} mailboxes in {} seconds",
            stats.synced_emails, stats.skipped_emails, stats.processed_mailboxes, stats.elapsed_seconds
        );
        let line = match (&outcome, &fatal_error) {
            (SyncOutcome::Completed, _) => format!("Sync completed successfully. {totals}."),
            (SyncOutcome::CompletedWithErrors, _) => {
                format!("Sync completed with {} errors. {totals}.", stats.errors.len())
            }
            (SyncOutcome::Stopped, _) => format!("Sync stopped by user. {totals}."),
            (SyncOutcome::Failed, Some(e)) => format!("Sync failed: {e}"),
            (SyncOutcome::Failed, None) => "Sync failed".to_string(),
        };

        match outcome {
            SyncOutcome::Failed => log::error!("Session {}: {line}", self.session_id),
            _ => log::info!("Session {}: {line}", self.session_id),
        }

        tracker.publish(ProgressUpdate {
            percentage: Some(100),
            is_complete: Some(true),
            phase: Some(if outcome == SyncOutcome::Failed {
                Phase::Error
            } else {
                Phase::Complete
            }),
            outcome: Some(outcome),
            processed_messages: Some(stats.processed_emails()),
            total_messages: Some(stats.total_emails),
            processed_mailboxes: Some(stats.processed_mailboxes),
            total_mailboxes: Some(stats.total_mailboxes),
            errors: Some(stats.errors.clone()),
            end_time: Some(ended),
            elapsed_seconds: Some(stats.elapsed_seconds),
            ..ProgressUpdate::log(line)
        });

        let store_error = tracker.store_error().map(|e| e.to_string());
        if let Some(e) = &store_error {
            log::warn!(
                "Session {}: {e} ({} failed store calls)",
                self.session_id,
                tracker.store_failures()
            );
        }

        SyncReport {
            session_id: self.session_id.clone(),
            outcome,
            stats,
            fatal_error,
            store_error,
        }
    }
}

/// Validate the inputs and run the sync in the background.
///
/// Configuration problems are reported here, before anything is spawned;
/// everything after that is reported through the progress store and the
/// returned report.
pub fn start_sync<C, S>(
    session_id: impl Into<String>,
    source: ImapConfig,
    destination: ImapConfig,
    options: SyncOptions,
    connector: Arc<C>,
    store: Arc<S>,
) -> SyncResult<JoinHandle<SyncReport>>
where
    C: Connector + 'static,
    S: ProgressStore + ?Sized + 'static,
{
    validate_config(&source, "Source")?;
    validate_config(&destination, "Destination")?;
    options.validate()?;

    let engine = SyncEngine::new(session_id, source, destination, options, connector, store);
    Ok(tokio::spawn(engine.run()))
}
