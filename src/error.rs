//! Error taxonomy of a sync run.
//!
//! Only `Connection` and `Enumeration` end a run early. Everything else is
//! recorded in the run's error list and the run carries on.

use crate::imap::{ImapError, MessageRef};
use crate::progress::StoreError;

pub type SyncResult<T> = Result<T, SyncError>;

/// Which side of the copy a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Destination => write!(f, "destination"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to connect to {role} server: {source}")]
    Connection {
        role: Role,
        #[source]
        source: ImapError,
    },

    #[error("Failed to list mailboxes: {0}")]
    Enumeration(#[source] ImapError),

    #[error("Error processing mailbox {mailbox}: {source}")]
    Mailbox {
        mailbox: String,
        #[source]
        source: ImapError,
    },

    #[error("{0}")]
    Message(String),

    #[error("Message too large ({} MB, limit {} MB)", mebibytes(.size), mebibytes(.limit))]
    SizeLimit { size: u64, limit: u64 },

    #[error("Progress store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn mailbox(mailbox: &str, source: ImapError) -> Self {
        SyncError::Mailbox {
            mailbox: mailbox.to_string(),
            source,
        }
    }

    /// Whether this error ends the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Connection { .. } | SyncError::Enumeration(_))
    }
}

impl From<ImapError> for SyncError {
    fn from(e: ImapError) -> Self {
        SyncError::Message(e.to_string())
    }
}

fn mebibytes(bytes: &u64) -> u64 {
    (bytes + 512 * 1024) / (1024 * 1024)
}

/// The error line recorded when a message is given up on.
pub fn message_error_line(mailbox: &str, reference: MessageRef, reason: &SyncError) -> String {
    format!("Error syncing message in {mailbox} ({reference}): {reason}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_limit_message_rounds_to_mebibytes() {
        let err = SyncError::SizeLimit {
            size: 30 * 1024 * 1024,
            limit: 25 * 1024 * 1024,
        };
        assert_eq!(err.to_string(), "Message too large (30 MB, limit 25 MB)");
    }

    #[test]
    fn test_fatal_classification() {
        let conn = SyncError::Connection {
            role: Role::Source,
            source: ImapError::Auth("bad password".into()),
        };
        assert!(conn.is_fatal());
        assert!(conn.to_string().starts_with("Failed to connect to source server"));
        assert!(SyncError::Enumeration(ImapError::Closed).is_fatal());
        assert!(!SyncError::mailbox("INBOX", ImapError::Closed).is_fatal());
        assert!(!SyncError::Message("boom".into()).is_fatal());
    }

    #[test]
    fn test_message_error_line() {
        let line = message_error_line("INBOX", MessageRef::Uid(7), &SyncError::Message("APPEND failed: NO".into()));
        assert_eq!(line, "Error syncing message in INBOX (UID 7): APPEND failed: NO");
    }
}
