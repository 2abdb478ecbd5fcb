//! Progress records shared with observers of a sync run.
//!
//! A record is keyed by session id. Every mutation goes through
//! [`ProgressRecord::merge`], which overlays the fields present in a
//! [`ProgressUpdate`] and appends (never replaces) logs and mailbox summaries.

mod memory;

pub use memory::InMemoryProgressStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of log entries a record retains; older entries are dropped first.
pub const MAX_LOG_ENTRIES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("progress store lock poisoned")]
    Poisoned,

    #[error("sync session {0} not found")]
    UnknownSession(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Start,
    Running,
    Complete,
    Error,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOutcome {
    Completed,
    CompletedWithErrors,
    Stopped,
    Failed,
}

/// Per-mailbox counts, appended once the mailbox is done and never changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxStat {
    pub name: String,
    pub total_messages: u64,
    pub synced_messages: u64,
    pub skipped_messages: u64,
}

impl MailboxStat {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn processed(&self) -> u64 {
        self.synced_messages + self.skipped_messages
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub session_id: String,
    pub percentage: u8,
    pub current_mailbox: String,
    pub processed_messages: u64,
    pub total_messages: u64,
    pub processed_mailboxes: u32,
    pub total_mailboxes: u32,
    pub logs: Vec<LogEntry>,
    pub is_complete: bool,
    pub phase: Phase,
    pub should_stop: bool,
    pub mailbox_summaries: Vec<MailboxStat>,
    pub errors: Vec<String>,
    pub outcome: Option<SyncOutcome>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<u64>,
}

impl ProgressRecord {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            percentage: 0,
            current_mailbox: String::new(),
            processed_messages: 0,
            total_messages: 0,
            processed_mailboxes: 0,
            total_mailboxes: 0,
            logs: Vec::new(),
            is_complete: false,
            phase: Phase::Start,
            should_stop: false,
            mailbox_summaries: Vec::new(),
            errors: Vec::new(),
            outcome: None,
            start_time: None,
            end_time: None,
            elapsed_seconds: None,
        }
    }

    /// Overlay the fields set in `update`. Logs and mailbox summaries are
    /// appended; logs are then trimmed to the newest [`MAX_LOG_ENTRIES`].
    pub fn merge(&mut self, update: ProgressUpdate) {
        let ProgressUpdate {
            percentage,
            current_mailbox,
            processed_messages,
            total_messages,
            processed_mailboxes,
            total_mailboxes,
            logs,
            is_complete,
            phase,
            should_stop,
            mailbox_summaries,
            errors,
            outcome,
            start_time,
            end_time,
            elapsed_seconds,
        } = update;

        if let Some(v) = percentage {
            self.percentage = v.min(100);
        }
        if let Some(v) = current_mailbox {
            self.current_mailbox = v;
        }
        if let Some(v) = processed_messages {
            self.processed_messages = v;
        }
        if let Some(v) = total_messages {
            self.total_messages = v;
        }
        if let Some(v) = processed_mailboxes {
            self.processed_mailboxes = v;
        }
        if let Some(v) = total_mailboxes {
            self.total_mailboxes = v;
        }
        if let Some(v) = is_complete {
            self.is_complete = v;
        }
        if let Some(v) = phase {
            self.phase = v;
        }
        if let Some(v) = should_stop {
            self.should_stop = v;
        }
        if let Some(v) = errors {
            self.errors = v;
        }
        if outcome.is_some() {
            self.outcome = outcome;
        }
        if start_time.is_some() {
            self.start_time = start_time;
        }
        if end_time.is_some() {
            self.end_time = end_time;
        }
        if elapsed_seconds.is_some() {
            self.elapsed_seconds = elapsed_seconds;
        }

        self.mailbox_summaries.extend(mailbox_summaries);
        if !logs.is_empty() {
            self.logs.extend(logs);
            if self.logs.len() > MAX_LOG_ENTRIES {
                let excess = self.logs.len() - MAX_LOG_ENTRIES;
                self.logs.drain(..excess);
            }
        }
    }
}

/// A partial record. Unset fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percentage: Option<u8>,
    pub current_mailbox: Option<String>,
    pub processed_messages: Option<u64>,
    pub total_messages: Option<u64>,
    pub processed_mailboxes: Option<u32>,
    pub total_mailboxes: Option<u32>,
    pub logs: Vec<LogEntry>,
    pub is_complete: Option<bool>,
    pub phase: Option<Phase>,
    pub should_stop: Option<bool>,
    pub mailbox_summaries: Vec<MailboxStat>,
    pub errors: Option<Vec<String>>,
    pub outcome: Option<SyncOutcome>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<u64>,
}

impl ProgressUpdate {
    /// An update carrying a single log line.
    pub fn log(message: impl Into<String>) -> Self {
        Self::default().with_log(message)
    }

    pub fn with_log(mut self, message: impl Into<String>) -> Self {
        self.logs.push(LogEntry::now(message));
        self
    }
}

/// Key-value store of progress records.
///
/// Implementations must tolerate concurrent use from independent runs;
/// updates for one session are applied in the order they are issued.
pub trait ProgressStore: Send + Sync {
    fn get(&self, session_id: &str) -> Result<Option<ProgressRecord>, StoreError>;

    /// Merge `update` into the session's record, creating a zeroed record
    /// first if none exists. Returns the resulting record.
    fn update(&self, session_id: &str, update: ProgressUpdate) -> Result<ProgressRecord, StoreError>;

    fn clear(&self, session_id: &str) -> Result<(), StoreError>;

    fn list_active(&self) -> Result<Vec<String>, StoreError>;
}

/// Ask a running sync to stop at its next checkpoint.
pub fn request_stop(store: &dyn ProgressStore, session_id: &str) -> Result<ProgressRecord, StoreError> {
    if store.get(session_id)?.is_none() {
        return Err(StoreError::UnknownSession(session_id.to_string()));
    }
    log::info!("Stop requested for sync session {session_id}");
    store.update(
        session_id,
        ProgressUpdate {
            should_stop: Some(true),
            ..ProgressUpdate::default()
        },
    )
}
