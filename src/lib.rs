//! Copy mail from one IMAP account to another.
//!
//! A run walks the source account's mailboxes one at a time, copies each
//! message with FETCH + APPEND and publishes its progress to a
//! [`progress::ProgressStore`] that observers poll. Runs can be stopped
//! cooperatively through [`progress::request_stop`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use imap_relay::{start_sync, AsyncImapConnector, ImapConfig, InMemoryProgressStore, SyncOptions};
//!
//! # async fn demo() -> Result<(), imap_relay::SyncError> {
//! let store = Arc::new(InMemoryProgressStore::new());
//! let handle = start_sync(
//!     "session-1",
//!     ImapConfig::new("imap.old.example", 993, "me", "secret"),
//!     ImapConfig::new("imap.new.example", 993, "me", "secret"),
//!     SyncOptions::default(),
//!     Arc::new(AsyncImapConnector),
//!     store,
//! )?;
//! let report = handle.await.expect("sync task");
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod imap;
pub mod progress;
pub mod sync;

pub use config::SyncRequest;
pub use error::{Role, SyncError, SyncResult};
pub use imap::{AsyncImapConnector, Connector, ImapConfig, ImapError, MailSession};
pub use progress::{
    request_stop, InMemoryProgressStore, MailboxStat, Phase, ProgressRecord, ProgressStore, ProgressUpdate,
    SyncOutcome,
};
pub use sync::{empty_account, probe, start_sync, ProbeReport, SyncOptions, SyncReport};
