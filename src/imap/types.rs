use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS from the first byte (typically port 993).
    #[serde(default)]
    pub secure: bool,
    /// Upgrade a plain connection with STARTTLS when `secure` is off.
    #[serde(default)]
    pub starttls: bool,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_greeting_timeout_ms")]
    pub greeting_timeout_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_greeting_timeout_ms() -> u64 {
    15_000
}

fn default_socket_timeout_ms() -> u64 {
    60_000
}

impl ImapConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            secure: port == 993,
            starttls: false,
            username: username.into(),
            password: password.into(),
            tls_verify: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            greeting_timeout_ms: default_greeting_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// `user@host:port`, for log lines. Never includes the password.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("starttls", &self.starttls)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls_verify", &self.tls_verify)
            .finish()
    }
}

/// One entry of a LIST response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxInfo {
    pub path: String, // raw path, used verbatim for IMAP commands
    pub name: String, // decoded display name (last segment)
    pub delimiter: String,
}

impl MailboxInfo {
    /// Build a descriptor from a raw LIST path, decoding the display name
    /// from modified UTF-7 (RFC 3501 §5.1.3).
    pub fn from_raw(path: &str, delimiter: Option<&str>) -> Self {
        let delimiter = delimiter.unwrap_or("/").to_string();
        let decoded = utf7_imap::decode_utf7_imap(path.to_string());
        let name = match decoded.rsplit_once(delimiter.as_str()) {
            Some((_, last)) if !delimiter.is_empty() => last.to_string(),
            _ => decoded.clone(),
        };
        Self {
            path: path.to_string(),
            name,
            delimiter,
        }
    }
}

/// How a message is addressed for FETCH.
///
/// UIDs are stable for the life of a session; sequence numbers shift when
/// the mailbox changes, so a UID is preferred whenever the server gave one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageRef {
    Sequence(u32),
    Uid(u32),
}

impl MessageRef {
    pub fn number(&self) -> u32 {
        match self {
            MessageRef::Sequence(n) | MessageRef::Uid(n) => *n,
        }
    }

    pub fn is_uid(&self) -> bool {
        matches!(self, MessageRef::Uid(_))
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRef::Uid(n) => write!(f, "UID {n}"),
            MessageRef::Sequence(n) => write!(f, "sequence {n}"),
        }
    }
}

/// Normalize raw SEARCH hits into references: drops the invalid number 0,
/// sorts ascending, removes duplicates and keeps the first `limit`.
pub fn refs_from_hits(hits: impl IntoIterator<Item = u32>, as_uid: bool, limit: usize) -> Vec<MessageRef> {
    let mut numbers: Vec<u32> = hits.into_iter().filter(|&n| n > 0).collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
        .into_iter()
        .take(limit)
        .map(|n| if as_uid { MessageRef::Uid(n) } else { MessageRef::Sequence(n) })
        .collect()
}

/// Data items requested by a single-message FETCH.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub size: bool,
    pub source: bool,
    pub body_structure: bool,
}

impl FetchOptions {
    pub fn size_only() -> Self {
        Self {
            size: true,
            ..Self::default()
        }
    }

    pub fn full() -> Self {
        Self {
            size: false,
            source: true,
            body_structure: true,
        }
    }

    pub(crate) fn query(&self) -> String {
        let mut items = Vec::new();
        if self.size {
            items.push("RFC822.SIZE");
        }
        if self.body_structure {
            items.push("BODYSTRUCTURE");
        }
        if self.source {
            items.push("BODY.PEEK[]");
        }
        if items.is_empty() {
            items.push("UID");
        }
        format!("({})", items.join(" "))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    pub size: Option<u32>,
    pub source: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStatus {
    pub messages: u32,
}
