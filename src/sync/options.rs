use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::imap::ImapConfig;

pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 25 * 1024 * 1024;

/// Tuning for one run. Fixed once the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Messages taken from each mailbox per run, processed as one chunk.
    pub batch_size: u32,
    /// Extra attempts per message after the first failure.
    pub max_retries: u32,
    /// Pause between attempts, in milliseconds.
    pub retry_delay: u64,
    /// Mailboxes copied per run, in server order.
    pub max_mailboxes: u32,
    /// Hard cap on messages copied per mailbox, applied on top of `batch_size`.
    pub max_messages_per_mailbox: u32,
    pub max_message_size_bytes: u64,
    /// Fetch and size-check but never write to the destination.
    pub dry_run: bool,
    /// Skip source messages whose Message-ID is already in the destination mailbox.
    pub skip_existing_messages: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 2,
            retry_delay: 1_000,
            max_mailboxes: 5,
            max_messages_per_mailbox: 100,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE,
            dry_run: false,
            skip_existing_messages: false,
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batchSize must be at least 1".into()));
        }
        if self.max_mailboxes == 0 {
            return Err(SyncError::Config("maxMailboxes must be at least 1".into()));
        }
        if self.max_messages_per_mailbox == 0 {
            return Err(SyncError::Config("maxMessagesPerMailbox must be at least 1".into()));
        }
        if self.max_message_size_bytes == 0 {
            return Err(SyncError::Config("maxMessageSizeBytes must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_millis(self.retry_delay),
        }
    }

    /// Message-level progress is published at most once per this many
    /// processed messages.
    pub fn publish_interval(&self) -> u64 {
        u64::from(self.batch_size.max(10))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

/// Reject connection settings missing a required field.
pub fn validate_config(config: &ImapConfig, role: &str) -> SyncResult<()> {
    let missing = [
        ("host", config.host.trim().is_empty()),
        ("port", config.port == 0),
        ("username", config.username.is_empty()),
        ("password", config.password.is_empty()),
    ]
    .into_iter()
    .filter(|(_, missing)| *missing)
    .map(|(field, _)| field)
    .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Config(format!(
            "{role} configuration is incomplete (missing {})",
            missing.join(", ")
        )))
    }
}
