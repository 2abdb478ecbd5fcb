//! Opening and closing the two sessions of a run.

use serde::Serialize;

use crate::error::{Role, SyncError, SyncResult};
use crate::imap::{shutdown_session, Connector, ImapConfig, ImapError, MailSession, MailboxInfo};

/// The source and destination sessions of one run.
///
/// A slot is filled only once its session authenticated, so
/// [`SessionPair::shutdown`] touches exactly the sessions that were opened.
pub struct SessionPair<S> {
    source: Option<S>,
    destination: Option<S>,
}

impl<S> Default for SessionPair<S> {
    fn default() -> Self {
        Self {
            source: None,
            destination: None,
        }
    }
}

impl<S: MailSession> SessionPair<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the source, then the destination. The destination is not
    /// attempted when the source fails.
    pub async fn connect<C>(&mut self, connector: &C, source: &ImapConfig, destination: &ImapConfig) -> SyncResult<()>
    where
        C: Connector<Session = S> + ?Sized,
    {
        log::info!("Connecting to source server {}", source.label());
        let session = connector.connect(source).await.map_err(|e| SyncError::Connection {
            role: Role::Source,
            source: e,
        })?;
        self.source = Some(session);
        log::info!("Connected to source server");

        log::info!("Connecting to destination server {}", destination.label());
        let session = connector.connect(destination).await.map_err(|e| SyncError::Connection {
            role: Role::Destination,
            source: e,
        })?;
        self.destination = Some(session);
        log::info!("Connected to destination server");
        Ok(())
    }

    pub fn source_mut(&mut self) -> SyncResult<&mut S> {
        self.source.as_mut().ok_or(SyncError::Connection {
            role: Role::Source,
            source: ImapError::Closed,
        })
    }

    pub fn both_mut(&mut self) -> SyncResult<(&mut S, &mut S)> {
        match (self.source.as_mut(), self.destination.as_mut()) {
            (Some(source), Some(destination)) => Ok((source, destination)),
            (None, _) => Err(SyncError::Connection {
                role: Role::Source,
                source: ImapError::Closed,
            }),
            (_, None) => Err(SyncError::Connection {
                role: Role::Destination,
                source: ImapError::Closed,
            }),
        }
    }

    /// Log out of every opened session. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.source.take() {
            shutdown_session(&mut session, "source").await;
        }
        if let Some(mut session) = self.destination.take() {
            shutdown_session(&mut session, "destination").await;
        }
    }
}

/// Result of a connectivity check against one account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub mailboxes: Vec<MailboxInfo>,
    /// Set when login worked but LIST did not.
    pub listing_error: Option<String>,
}

impl ProbeReport {
    pub fn summary(&self) -> String {
        match &self.listing_error {
            None => format!("Connected successfully. Found {} folder(s).", self.mailboxes.len()),
            Some(e) => format!("Connected successfully, but could not list folders: {e}"),
        }
    }
}

/// Log in, list mailboxes and log out again.
///
/// Login failures are errors; a failing LIST is reported in the result.
pub async fn probe<C>(connector: &C, config: &ImapConfig) -> SyncResult<ProbeReport>
where
    C: Connector + ?Sized,
{
    log::info!("Testing connection to {}", config.label());
    let mut session = connector.connect(config).await.map_err(|e| SyncError::Connection {
        role: Role::Source,
        source: e,
    })?;

    let report = match session.list().await {
        Ok(mailboxes) => ProbeReport {
            mailboxes,
            listing_error: None,
        },
        Err(e) => {
            log::warn!("Listing folders on {} failed: {e}", config.label());
            ProbeReport {
                mailboxes: Vec::new(),
                listing_error: Some(e.to_string()),
            }
        }
    };

    shutdown_session(&mut session, "probed").await;
    Ok(report)
}
