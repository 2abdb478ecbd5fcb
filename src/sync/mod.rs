//! The sync engine: mailbox enumeration, message transfer, retries and
//! progress publication.

pub mod connection;
pub mod engine;
pub mod enumerate;
pub mod options;
pub mod purge;
pub mod retry;
pub mod tracker;
pub mod transfer;

pub use connection::{probe, ProbeReport, SessionPair};
pub use engine::{start_sync, RunStats, SyncEngine, SyncReport};
pub use options::{validate_config, RetryPolicy, SyncOptions};
pub use purge::empty_account;
