use crate::error::{SyncError, SyncResult};
use crate::imap::{MailSession, MailboxInfo};

/// Mailboxes selected for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxListing {
    /// At most `max_mailboxes` entries, in server order.
    pub mailboxes: Vec<MailboxInfo>,
    /// How many the server reported before capping.
    pub discovered: usize,
}

impl MailboxListing {
    pub fn is_capped(&self) -> bool {
        self.discovered > self.mailboxes.len()
    }
}

/// LIST the source account and keep the first `max_mailboxes` entries.
pub async fn list_mailboxes<S>(source: &mut S, max_mailboxes: u32) -> SyncResult<MailboxListing>
where
    S: MailSession + ?Sized,
{
    let mut mailboxes = source.list().await.map_err(SyncError::Enumeration)?;
    let discovered = mailboxes.len();
    mailboxes.truncate(max_mailboxes as usize);

    log::info!(
        "Found {discovered} mailboxes on source, processing {}",
        mailboxes.len()
    );
    for mailbox in &mailboxes {
        log::debug!("Selected mailbox {} (delimiter {:?})", mailbox.path, mailbox.delimiter);
    }

    Ok(MailboxListing { mailboxes, discovered })
}
