//! Scripted IMAP accounts and a recording progress store for engine tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use imap_relay::imap::{FetchOptions, FetchedMessage, MailboxInfo, MailboxStatus, MessageRef};
use imap_relay::progress::StoreError;
use imap_relay::sync::SyncOptions;
use imap_relay::{
    Connector, ImapConfig, ImapError, InMemoryProgressStore, MailSession, ProgressRecord, ProgressStore,
    ProgressUpdate,
};

pub const SOURCE_HOST: &str = "source.test";
pub const DESTINATION_HOST: &str = "destination.test";

/// Raw RFC 822 text with a predictable Message-ID.
pub fn raw_message(id: &str) -> Vec<u8> {
    format!("Message-ID: <{id}@test>\r\nSubject: Message {id}\r\nFrom: a@test\r\n\r\nBody of {id}\r\n").into_bytes()
}

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub uid: u32,
    pub size: u32,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct MockMailbox {
    pub path: String,
    pub messages: Vec<MockMessage>,
    next_uid: u32,
}

impl MockMailbox {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            messages: Vec::new(),
            next_uid: 1,
        }
    }

    pub fn with_messages(path: &str, ids: &[&str]) -> Self {
        let mut mailbox = Self::new(path);
        for id in ids {
            mailbox.push(raw_message(id));
        }
        mailbox
    }

    pub fn push(&mut self, raw: Vec<u8>) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.messages.push(MockMessage {
            uid,
            size: raw.len() as u32,
            raw,
        });
        uid
    }

    /// Add a message whose reported RFC822.SIZE differs from its content.
    pub fn push_with_size(&mut self, raw: Vec<u8>, size: u32) -> u32 {
        let uid = self.push(raw);
        if let Some(message) = self.messages.last_mut() {
            message.size = size;
        }
        uid
    }
}

/// One account plus the knobs tests use to make it misbehave.
#[derive(Debug, Default)]
pub struct Account {
    pub mailboxes: Vec<MockMailbox>,
    pub fail_connect: bool,
    pub fail_list: bool,
    pub fail_search: bool,
    pub fail_logout: bool,
    /// CREATE fails (not as already-exists) for these paths.
    pub fail_create: Vec<String>,
    /// APPEND rejects content containing this marker.
    pub reject_marker: Option<String>,
    /// The next this-many APPENDs fail, then they succeed.
    pub transient_append_failures: u32,
    /// DELETE is refused for these paths.
    pub undeletable: Vec<String>,

    pub connects: u32,
    pub logouts: u32,
    pub closes: u32,
    pub created: Vec<String>,
    pub appended: Vec<(String, Vec<u8>)>,
    /// Every APPEND issued, successful or not.
    pub append_attempts: u32,
    pub full_fetches: u32,
}

impl Account {
    pub fn with_mailboxes(mailboxes: Vec<MockMailbox>) -> Self {
        Self {
            mailboxes,
            ..Self::default()
        }
    }

    pub fn mailbox(&self, path: &str) -> Option<&MockMailbox> {
        self.mailboxes.iter().find(|m| m.path == path)
    }

    fn mailbox_mut(&mut self, path: &str) -> Option<&mut MockMailbox> {
        self.mailboxes.iter_mut().find(|m| m.path == path)
    }
}

/// Accounts keyed by host name, shared between the connector and the test.
#[derive(Clone, Default)]
pub struct MockServer {
    accounts: Arc<Mutex<HashMap<String, Account>>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(source: Account, destination: Account) -> Self {
        let server = Self::new();
        server.insert(SOURCE_HOST, source);
        server.insert(DESTINATION_HOST, destination);
        server
    }

    pub fn insert(&self, host: &str, account: Account) {
        self.accounts.lock().unwrap().insert(host.to_string(), account);
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector { server: self.clone() }
    }

    /// Inspect an account.
    pub fn account<T>(&self, host: &str, f: impl FnOnce(&Account) -> T) -> T {
        let accounts = self.accounts.lock().unwrap();
        f(accounts.get(host).expect("unknown host"))
    }

    fn with_account<T>(&self, host: &str, f: impl FnOnce(&mut Account) -> T) -> T {
        let mut accounts = self.accounts.lock().unwrap();
        f(accounts.get_mut(host).expect("unknown host"))
    }
}

pub struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, config: &ImapConfig) -> Result<MockSession, ImapError> {
        let mut accounts = self.server.accounts.lock().unwrap();
        match accounts.get_mut(&config.host) {
            Some(account) if !account.fail_connect => {
                account.connects += 1;
                Ok(MockSession {
                    host: config.host.clone(),
                    server: self.server.clone(),
                    selected: None,
                })
            }
            _ => Err(ImapError::Connect {
                host: config.host.clone(),
                port: config.port,
                reason: "connection refused".into(),
            }),
        }
    }
}

pub struct MockSession {
    host: String,
    server: MockServer,
    selected: Option<String>,
}

impl MockSession {
    fn account<T>(&self, f: impl FnOnce(&mut Account) -> T) -> T {
        self.server.with_account(&self.host, f)
    }

    fn selected(&self) -> Result<String, ImapError> {
        self.selected
            .clone()
            .ok_or_else(|| ImapError::command("FETCH", "no mailbox selected"))
    }
}

fn locate(mailbox: &MockMailbox, reference: MessageRef) -> Option<&MockMessage> {
    match reference {
        MessageRef::Uid(uid) => mailbox.messages.iter().find(|m| m.uid == uid),
        MessageRef::Sequence(n) => mailbox.messages.get((n as usize).checked_sub(1)?),
    }
}

fn header_block(raw: &[u8]) -> Vec<u8> {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(end) => raw[..end + 4].to_vec(),
        None => raw.to_vec(),
    }
}

#[async_trait]
impl MailSession for MockSession {
    async fn list(&mut self) -> Result<Vec<MailboxInfo>, ImapError> {
        self.account(|account| {
            if account.fail_list {
                return Err(ImapError::command("LIST", "server unavailable"));
            }
            Ok(account
                .mailboxes
                .iter()
                .map(|m| MailboxInfo::from_raw(&m.path, Some("/")))
                .collect())
        })
    }

    async fn mailbox_open(&mut self, path: &str) -> Result<u32, ImapError> {
        let exists = self.account(|account| {
            account
                .mailbox(path)
                .map(|m| m.messages.len() as u32)
                .ok_or_else(|| ImapError::command("SELECT", "no such mailbox"))
        })?;
        self.selected = Some(path.to_string());
        Ok(exists)
    }

    async fn mailbox_create(&mut self, path: &str) -> Result<(), ImapError> {
        self.account(|account| {
            if account.fail_create.iter().any(|p| p == path) {
                return Err(ImapError::command("CREATE", "permission denied"));
            }
            if account.mailbox(path).is_some() {
                return Err(ImapError::AlreadyExists(path.to_string()));
            }
            account.mailboxes.push(MockMailbox::new(path));
            account.created.push(path.to_string());
            Ok(())
        })
    }

    async fn mailbox_delete(&mut self, path: &str) -> Result<(), ImapError> {
        self.account(|account| {
            if account.undeletable.iter().any(|p| p == path) {
                return Err(ImapError::command("DELETE", "cannot delete this mailbox"));
            }
            let before = account.mailboxes.len();
            account.mailboxes.retain(|m| m.path != path);
            if account.mailboxes.len() == before {
                return Err(ImapError::command("DELETE", "no such mailbox"));
            }
            Ok(())
        })
    }

    async fn status(&mut self, path: &str) -> Result<MailboxStatus, ImapError> {
        self.account(|account| {
            account
                .mailbox(path)
                .map(|m| MailboxStatus {
                    messages: m.messages.len() as u32,
                })
                .ok_or_else(|| ImapError::command("STATUS", "no such mailbox"))
        })
    }

    async fn search_all(&mut self, limit: usize) -> Result<Vec<MessageRef>, ImapError> {
        let path = self.selected()?;
        self.account(|account| {
            if account.fail_search {
                return Err(ImapError::command("SEARCH", "BAD command unknown"));
            }
            let mailbox = account.mailbox(&path).ok_or(ImapError::Closed)?;
            Ok(mailbox
                .messages
                .iter()
                .map(|m| MessageRef::Uid(m.uid))
                .take(limit)
                .collect())
        })
    }

    async fn fetch_one(
        &mut self,
        reference: MessageRef,
        options: FetchOptions,
    ) -> Result<Option<FetchedMessage>, ImapError> {
        let path = self.selected()?;
        self.account(|account| {
            if options.source {
                account.full_fetches += 1;
            }
            let mailbox = account.mailbox(&path).ok_or(ImapError::Closed)?;
            Ok(locate(mailbox, reference).map(|message| FetchedMessage {
                size: options.size.then_some(message.size),
                source: options.source.then(|| message.raw.clone()),
            }))
        })
    }

    async fn fetch_headers(&mut self) -> Result<Vec<Vec<u8>>, ImapError> {
        let path = self.selected()?;
        self.account(|account| {
            let mailbox = account.mailbox(&path).ok_or(ImapError::Closed)?;
            Ok(mailbox.messages.iter().map(|m| header_block(&m.raw)).collect())
        })
    }

    async fn append(&mut self, path: &str, content: &[u8]) -> Result<(), ImapError> {
        self.account(|account| {
            account.append_attempts += 1;
            if account.transient_append_failures > 0 {
                account.transient_append_failures -= 1;
                return Err(ImapError::command("APPEND", "NO [UNAVAILABLE] try again"));
            }
            if let Some(marker) = &account.reject_marker {
                let text = String::from_utf8_lossy(content);
                if text.contains(marker.as_str()) {
                    return Err(ImapError::command("APPEND", "NO [OVERQUOTA] mailbox is full"));
                }
            }
            let mailbox = account
                .mailbox_mut(path)
                .ok_or_else(|| ImapError::command("APPEND", "[TRYCREATE] no such mailbox"))?;
            mailbox.push(content.to_vec());
            account.appended.push((path.to_string(), content.to_vec()));
            Ok(())
        })
    }

    async fn delete_messages(&mut self, references: &[MessageRef]) -> Result<(), ImapError> {
        let path = self.selected()?;
        self.account(|account| {
            let mailbox = account.mailbox_mut(&path).ok_or(ImapError::Closed)?;
            let uids: Vec<u32> = references
                .iter()
                .filter_map(|r| locate(mailbox, *r).map(|m| m.uid))
                .collect();
            mailbox.messages.retain(|m| !uids.contains(&m.uid));
            Ok(())
        })
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.account(|account| {
            account.logouts += 1;
            if account.fail_logout {
                Err(ImapError::command("LOGOUT", "connection reset"))
            } else {
                Ok(())
            }
        })
    }

    async fn close(&mut self) {
        self.account(|account| account.closes += 1);
    }
}

type StopPredicate = Box<dyn Fn(&ProgressRecord) -> bool + Send + Sync>;

/// In-memory store that keeps every published snapshot and can raise the
/// stop flag once a condition on the record holds.
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryProgressStore,
    history: Mutex<Vec<ProgressRecord>>,
    stop_when: Option<StopPredicate>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stopping_when(predicate: impl Fn(&ProgressRecord) -> bool + Send + Sync + 'static) -> Self {
        Self {
            stop_when: Some(Box::new(predicate)),
            ..Self::default()
        }
    }

    pub fn history(&self) -> Vec<ProgressRecord> {
        self.history.lock().unwrap().clone()
    }

    pub fn record(&self, session_id: &str) -> ProgressRecord {
        self.inner.get(session_id).unwrap().expect("no record for session")
    }
}

impl ProgressStore for RecordingStore {
    fn get(&self, session_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        self.inner.get(session_id)
    }

    fn update(&self, session_id: &str, update: ProgressUpdate) -> Result<ProgressRecord, StoreError> {
        let mut record = self.inner.update(session_id, update)?;
        if let Some(predicate) = &self.stop_when {
            if !record.should_stop && !record.is_complete && predicate(&record) {
                record = self.inner.update(
                    session_id,
                    ProgressUpdate {
                        should_stop: Some(true),
                        ..ProgressUpdate::default()
                    },
                )?;
            }
        }
        self.history.lock().unwrap().push(record.clone());
        Ok(record)
    }

    fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        self.inner.clear(session_id)
    }

    fn list_active(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_active()
    }
}

/// A store whose every call fails.
pub struct BrokenStore;

impl ProgressStore for BrokenStore {
    fn get(&self, _: &str) -> Result<Option<ProgressRecord>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn update(&self, _: &str, _: ProgressUpdate) -> Result<ProgressRecord, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn clear(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }

    fn list_active(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Poisoned)
    }
}

pub fn source_config() -> ImapConfig {
    ImapConfig::new(SOURCE_HOST, 993, "me@source.test", "source-secret")
}

pub fn destination_config() -> ImapConfig {
    ImapConfig::new(DESTINATION_HOST, 993, "me@destination.test", "destination-secret")
}

/// Defaults without retry pauses.
pub fn fast_options() -> SyncOptions {
    SyncOptions {
        retry_delay: 0,
        ..SyncOptions::default()
    }
}
