//! Progress publication for one run.
//!
//! The tracker keeps a local mirror of everything it publishes, so a failing
//! store only costs visibility, never the transfer itself.

use std::sync::Arc;

use crate::error::SyncError;
use crate::progress::{ProgressRecord, ProgressStore, ProgressUpdate, StoreError};

/// Share of the bar reserved for connecting.
pub const CONNECTED_PERCENTAGE: u8 = 5;
/// Highest value reported before the run is finalized.
pub const MAX_RUNNING_PERCENTAGE: u8 = 95;

/// `5 + floor(processed / total * 90)`, capped at 95.
pub fn message_percentage(processed: u64, total_known: u64) -> u8 {
    if total_known == 0 {
        return CONNECTED_PERCENTAGE;
    }
    let share = processed.min(total_known) * 90 / total_known;
    (u64::from(CONNECTED_PERCENTAGE) + share).min(u64::from(MAX_RUNNING_PERCENTAGE)) as u8
}

/// Fallback while no message totals are known: advance by mailbox index.
pub fn mailbox_percentage(index: usize, mailbox_count: usize) -> u8 {
    if mailbox_count == 0 {
        return CONNECTED_PERCENTAGE;
    }
    let share = ((index + 1).min(mailbox_count) * 90 / mailbox_count) as u64;
    (u64::from(CONNECTED_PERCENTAGE) + share).min(u64::from(MAX_RUNNING_PERCENTAGE)) as u8
}

/// Whether a message-level update is due.
///
/// Due every `interval` processed messages, when the current mailbox is
/// done, or on the heartbeat after every fifth synced message.
pub fn message_update_due(
    processed_in_run: u64,
    interval: u64,
    mailbox_processed: u64,
    mailbox_total: u64,
    synced_heartbeat: bool,
) -> bool {
    (interval > 0 && processed_in_run % interval == 0) || mailbox_processed >= mailbox_total || synced_heartbeat
}

pub struct ProgressTracker<S: ProgressStore + ?Sized> {
    store: Arc<S>,
    session_id: String,
    local: ProgressRecord,
    store_failures: u32,
    first_store_error: Option<StoreError>,
}

impl<S: ProgressStore + ?Sized> ProgressTracker<S> {
    pub fn new(store: Arc<S>, session_id: &str) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
            local: ProgressRecord::new(session_id),
            store_failures: 0,
            first_store_error: None,
        }
    }

    /// Publish an update. The percentage never goes backwards within a run.
    pub fn publish(&mut self, mut update: ProgressUpdate) {
        if let Some(percentage) = update.percentage {
            update.percentage = Some(percentage.max(self.local.percentage));
        }
        self.local.merge(update.clone());

        if let Err(e) = self.store.update(&self.session_id, update) {
            log::warn!(
                "Progress update for session {} failed ({} so far): {e}",
                self.session_id,
                self.store_failures + 1
            );
            self.record_failure(e);
        }
    }

    fn record_failure(&mut self, error: StoreError) {
        self.store_failures += 1;
        self.first_store_error.get_or_insert(error);
    }

    /// Cooperative stop checkpoint. A store that cannot be read counts as
    /// "keep going".
    pub fn stop_requested(&mut self) -> bool {
        match self.store.get(&self.session_id) {
            Ok(Some(record)) => record.should_stop,
            Ok(None) => false,
            Err(e) => {
                log::warn!("Could not read stop flag for session {}: {e}", self.session_id);
                self.record_failure(e);
                false
            }
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Everything published so far, independent of the store's health.
    pub fn local(&self) -> &ProgressRecord {
        &self.local
    }

    pub fn percentage(&self) -> u8 {
        self.local.percentage
    }

    pub fn store_failures(&self) -> u32 {
        self.store_failures
    }

    /// The first store failure of the run, if the store ever failed.
    pub fn store_error(&self) -> Option<SyncError> {
        self.first_store_error.clone().map(SyncError::Store)
    }
}
