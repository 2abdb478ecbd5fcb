//! The IMAP capability the sync engine depends on.
//!
//! The engine only talks to these two traits; `client` implements them on top
//! of async-imap, and tests drive the engine with scripted sessions.

use async_trait::async_trait;

use super::types::{FetchOptions, FetchedMessage, ImapConfig, MailboxInfo, MailboxStatus, MessageRef};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImapError {
    #[error("TCP connect to {host}:{port} failed: {reason}")]
    Connect { host: String, port: u16, reason: String },

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },

    #[error("{operation} failed: {reason}")]
    Command { operation: &'static str, reason: String },

    #[error("mailbox {0} already exists")]
    AlreadyExists(String),

    #[error("session is closed")]
    Closed,
}

impl ImapError {
    pub fn command(operation: &'static str, reason: impl ToString) -> Self {
        ImapError::Command {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// One authenticated IMAP session.
///
/// Every method is a suspension point: the caller does not proceed until the
/// server answered or the socket timeout fired.
#[async_trait]
pub trait MailSession: Send {
    async fn list(&mut self) -> Result<Vec<MailboxInfo>, ImapError>;

    /// SELECT a mailbox; returns its EXISTS count.
    async fn mailbox_open(&mut self, path: &str) -> Result<u32, ImapError>;

    /// CREATE a mailbox. Fails with `ImapError::AlreadyExists` if the server
    /// reports the mailbox is already there.
    async fn mailbox_create(&mut self, path: &str) -> Result<(), ImapError>;

    async fn mailbox_delete(&mut self, path: &str) -> Result<(), ImapError>;

    async fn status(&mut self, path: &str) -> Result<MailboxStatus, ImapError>;

    /// SEARCH ALL in the selected mailbox, at most `limit` references in
    /// ascending order.
    async fn search_all(&mut self, limit: usize) -> Result<Vec<MessageRef>, ImapError>;

    /// FETCH a single message. `Ok(None)` when the server returned no item.
    async fn fetch_one(
        &mut self,
        reference: MessageRef,
        options: FetchOptions,
    ) -> Result<Option<FetchedMessage>, ImapError>;

    /// Raw header blocks of every message in the selected mailbox.
    async fn fetch_headers(&mut self) -> Result<Vec<Vec<u8>>, ImapError>;

    async fn append(&mut self, path: &str, content: &[u8]) -> Result<(), ImapError>;

    /// Flag messages `\Deleted` and expunge them.
    async fn delete_messages(&mut self, references: &[MessageRef]) -> Result<(), ImapError>;

    async fn logout(&mut self) -> Result<(), ImapError>;

    /// Drop the connection without a protocol goodbye.
    async fn close(&mut self);
}

/// Opens authenticated sessions from connection settings.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: MailSession + 'static;

    async fn connect(&self, config: &ImapConfig) -> Result<Self::Session, ImapError>;
}

/// Logout, falling back to a hard close. Never fails; the outcome is logged.
pub async fn shutdown_session<S: MailSession + ?Sized>(session: &mut S, role: &str) {
    match session.logout().await {
        Ok(()) => log::info!("Logged out from {role} server"),
        Err(e) => {
            log::warn!("Logout from {role} server failed: {e}; closing connection");
            session.close().await;
        }
    }
}
