pub mod client;
pub mod session;
pub mod types;

pub use client::{AsyncImapConnector, AsyncImapSession};
pub use session::{shutdown_session, Connector, ImapError, MailSession};
pub use types::{FetchOptions, FetchedMessage, ImapConfig, MailboxInfo, MailboxStatus, MessageRef};
