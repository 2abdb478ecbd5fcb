//! Emptying an account before a fresh copy.

use crate::error::{Role, SyncError, SyncResult};
use crate::imap::{shutdown_session, Connector, ImapConfig, ImapError, MailSession};

/// Remove every message from every mailbox of the account, keeping the
/// mailboxes themselves. Returns the paths that ended up empty.
///
/// A mailbox is deleted and recreated; when the server refuses the delete
/// (INBOX, typically) its messages are flagged and expunged instead.
pub async fn empty_account<C>(connector: &C, config: &ImapConfig) -> SyncResult<Vec<String>>
where
    C: Connector + ?Sized,
{
    log::info!("Emptying account {}", config.label());
    let mut session = connector.connect(config).await.map_err(|e| SyncError::Connection {
        role: Role::Destination,
        source: e,
    })?;

    let result = empty_mailboxes(&mut session).await;
    shutdown_session(&mut session, "destination").await;
    result
}

async fn empty_mailboxes<S: MailSession>(session: &mut S) -> SyncResult<Vec<String>> {
    let mailboxes = session.list().await.map_err(SyncError::Enumeration)?;

    let mut emptied = Vec::with_capacity(mailboxes.len());
    for mailbox in mailboxes {
        match empty_mailbox(session, &mailbox.path).await {
            Ok(()) => {
                log::info!("Emptied mailbox {}", mailbox.path);
                emptied.push(mailbox.path);
            }
            Err(e) => log::warn!("Could not empty mailbox {}: {e}", mailbox.path),
        }
    }
    Ok(emptied)
}

async fn empty_mailbox<S: MailSession>(session: &mut S, path: &str) -> Result<(), ImapError> {
    if let Err(e) = session.mailbox_delete(path).await {
        log::debug!("Deleting {path} failed ({e}), expunging its messages instead");
        if let Err(e) = expunge_all(session, path).await {
            log::warn!("Expunging messages in {path} failed: {e}");
        }
    }

    match session.mailbox_create(path).await {
        Ok(()) | Err(ImapError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn expunge_all<S: MailSession>(session: &mut S, path: &str) -> Result<(), ImapError> {
    session.mailbox_open(path).await?;
    let messages = session.search_all(usize::MAX).await?;
    if messages.is_empty() {
        return Ok(());
    }
    session.delete_messages(&messages).await
}
