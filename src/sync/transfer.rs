//! Copying the messages of one mailbox.
//!
//! [`prepare`] opens both sides and resolves which messages to copy;
//! [`transfer_message`] copies one of them with retries. The caller owns the
//! loop between the two so it can check for stop requests and publish
//! progress between messages.

use std::collections::HashSet;

use futures::future::BoxFuture;
use mail_parser::MessageParser;

use super::options::SyncOptions;
use super::retry;
use crate::error::{message_error_line, SyncError, SyncResult};
use crate::imap::{FetchOptions, ImapError, MailSession, MessageRef};

/// A mailbox ready for copying.
#[derive(Debug, Clone, Default)]
pub struct PreparedMailbox {
    pub path: String,
    /// Message count reported by STATUS on the source.
    pub server_count: u32,
    /// The working set, in ascending order.
    pub refs: Vec<MessageRef>,
    /// Message-IDs already present in the destination mailbox.
    pub existing_ids: HashSet<String>,
    /// Set when SEARCH failed and sequence numbers are used instead.
    pub sequence_fallback: bool,
}

/// Result of copying a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Synced { bytes: usize },
    /// Zero-size messages carry nothing to copy.
    SkippedEmpty,
    /// The destination already holds a message with the same Message-ID.
    SkippedExisting,
    /// Every attempt failed; `error` is the line recorded for the run.
    Failed { error: String },
}

impl MessageOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, MessageOutcome::Synced { .. })
    }
}

/// Open the source mailbox, make sure the destination exists and resolve
/// the working set: at most `batch_size` and `max_messages_per_mailbox`
/// messages, lowest first.
pub async fn prepare<S>(
    source: &mut S,
    destination: &mut S,
    path: &str,
    options: &SyncOptions,
) -> SyncResult<PreparedMailbox>
where
    S: MailSession,
{
    source
        .mailbox_open(path)
        .await
        .map_err(|e| SyncError::mailbox(path, e))?;
    log::debug!("Opened source mailbox {path}");

    let mut existing_ids = HashSet::new();
    if options.dry_run {
        log::debug!("Dry run: leaving destination mailbox {path} untouched");
    } else {
        match destination.mailbox_create(path).await {
            Ok(()) => log::info!("Created destination mailbox {path}"),
            Err(ImapError::AlreadyExists(_)) => log::debug!("Destination mailbox {path} already exists"),
            Err(e) => return Err(SyncError::mailbox(path, e)),
        }
        let present = destination
            .mailbox_open(path)
            .await
            .map_err(|e| SyncError::mailbox(path, e))?;

        if options.skip_existing_messages && present > 0 {
            match destination.fetch_headers().await {
                Ok(headers) => {
                    existing_ids = headers.iter().filter_map(|raw| message_id(raw)).collect();
                    log::info!("{} messages already in destination mailbox {path}", existing_ids.len());
                }
                Err(e) => log::warn!("Could not read existing messages in {path}, copying all: {e}"),
            }
        }
    }

    let status = source.status(path).await.map_err(|e| SyncError::mailbox(path, e))?;
    if status.messages == 0 {
        return Ok(PreparedMailbox {
            path: path.to_string(),
            existing_ids,
            ..PreparedMailbox::default()
        });
    }

    let limit = status
        .messages
        .min(options.max_messages_per_mailbox)
        .min(options.batch_size) as usize;
    let (refs, sequence_fallback) = match source.search_all(limit).await {
        Ok(refs) if !refs.is_empty() => (refs, false),
        Ok(_) => {
            log::warn!(
                "SEARCH in {path} returned nothing although STATUS reports {} messages; using sequence numbers",
                status.messages
            );
            (sequence_refs(limit), true)
        }
        Err(e) => {
            log::warn!("SEARCH in {path} failed, using sequence numbers: {e}");
            (sequence_refs(limit), true)
        }
    };

    Ok(PreparedMailbox {
        path: path.to_string(),
        server_count: status.messages,
        refs,
        existing_ids,
        sequence_fallback,
    })
}

fn sequence_refs(limit: usize) -> Vec<MessageRef> {
    (1..=limit as u32).map(MessageRef::Sequence).collect()
}

/// Copy one message, retrying per the run's retry policy.
pub async fn transfer_message<S>(
    source: &mut S,
    destination: &mut S,
    mailbox: &PreparedMailbox,
    reference: MessageRef,
    options: &SyncOptions,
) -> MessageOutcome
where
    S: MailSession,
{
    let mut job = MessageJob {
        source,
        destination,
        mailbox,
        reference,
        options,
    };

    match retry::attempt(options.retry_policy(), &mut job, run_attempt).await {
        Ok(outcome) => outcome,
        Err(exhausted) => {
            let error = message_error_line(&mailbox.path, reference, &exhausted.last_error);
            log::warn!("{error} (gave up after {} attempts)", exhausted.attempts);
            MessageOutcome::Failed { error }
        }
    }
}

struct MessageJob<'a, S> {
    source: &'a mut S,
    destination: &'a mut S,
    mailbox: &'a PreparedMailbox,
    reference: MessageRef,
    options: &'a SyncOptions,
}

fn run_attempt<'c, 'a, S: MailSession>(
    job: &'c mut MessageJob<'a, S>,
    attempt: u32,
) -> BoxFuture<'c, Result<MessageOutcome, SyncError>> {
    if attempt > 1 {
        log::debug!("Retrying {} in {} (attempt {attempt})", job.reference, job.mailbox.path);
    }
    Box::pin(job.copy_once())
}

impl<'a, S: MailSession> MessageJob<'a, S> {
    async fn copy_once(&mut self) -> Result<MessageOutcome, SyncError> {
        let size = self
            .source
            .fetch_one(self.reference, FetchOptions::size_only())
            .await?
            .and_then(|m| m.size)
            .unwrap_or(0);

        if size == 0 {
            log::info!("Skipping empty message {} in {}", self.reference, self.mailbox.path);
            return Ok(MessageOutcome::SkippedEmpty);
        }
        let limit = self.options.max_message_size_bytes;
        if u64::from(size) > limit {
            return Err(SyncError::SizeLimit {
                size: u64::from(size),
                limit,
            });
        }

        let content = self
            .source
            .fetch_one(self.reference, FetchOptions::full())
            .await?
            .and_then(|m| m.source)
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| SyncError::Message("Message source not available in fetch result".into()))?;

        if !self.mailbox.existing_ids.is_empty() {
            if let Some(id) = message_id(&content) {
                if self.mailbox.existing_ids.contains(&id) {
                    log::debug!("Message {id} already in destination mailbox {}", self.mailbox.path);
                    return Ok(MessageOutcome::SkippedExisting);
                }
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            let subject = MessageParser::default()
                .parse(&content[..])
                .and_then(|m| m.subject().map(str::to_string))
                .unwrap_or_default();
            log::debug!("Copying {} ({size} bytes) \"{subject}\"", self.reference);
        }

        if self.options.dry_run {
            return Ok(MessageOutcome::Synced { bytes: content.len() });
        }

        self.destination.append(&self.mailbox.path, &content).await?;
        Ok(MessageOutcome::Synced { bytes: content.len() })
    }
}

/// The Message-ID header of a raw message or header block.
pub(crate) fn message_id(raw: &[u8]) -> Option<String> {
    MessageParser::default()
        .parse(raw)
        .and_then(|message| message.message_id().map(str::to_string))
}
