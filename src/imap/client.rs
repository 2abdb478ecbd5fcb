use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tokio_native_tls::TlsStream;

use super::session::{Connector, ImapError, MailSession};
use super::types::*;

// ---------- Stream wrapper ----------

/// Wrapper to unify TLS / plain streams so Session can be generic.
pub(crate) enum ImapStream {
    Tls(TlsStream<TcpStream>),
    Plain(TcpStream),
}

impl tokio::io::AsyncRead for ImapStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for ImapStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapStream::Tls(_) => write!(f, "ImapStream::Tls"),
            ImapStream::Plain(_) => write!(f, "ImapStream::Plain"),
        }
    }
}

// ---------- Idle deadline ----------

/// Fails reads and writes with `TimedOut` once the peer makes no progress
/// for `limit`. The deadline re-arms after every completed read or write, so
/// a slow transfer that keeps moving is never cut off.
pub(crate) struct IdleTimeout<S> {
    inner: S,
    limit: Duration,
    read_timer: IdleTimer,
    write_timer: IdleTimer,
}

impl<S> IdleTimeout<S> {
    pub(crate) fn new(inner: S, limit: Duration) -> Self {
        Self {
            inner,
            limit,
            read_timer: IdleTimer::default(),
            write_timer: IdleTimer::default(),
        }
    }
}

#[derive(Default)]
struct IdleTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl IdleTimer {
    /// Wrap one poll of the inner stream. Pending polls start the deadline
    /// if it is not already running; ready polls disarm it.
    fn guard<T>(&mut self, limit: Duration, cx: &mut Context<'_>, polled: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if polled.is_ready() {
            self.armed = false;
            return polled;
        }

        if !self.armed {
            let deadline = Instant::now() + limit;
            match self.sleep.as_mut() {
                Some(sleep) => sleep.as_mut().reset(deadline),
                None => self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
            }
            self.armed = true;
        }

        match self.sleep.as_mut().map(|sleep| sleep.as_mut().poll(cx)) {
            Some(Poll::Ready(())) => {
                self.armed = false;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data moved for {}ms", limit.as_millis()),
                )))
            }
            _ => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.read_timer.guard(this.limit, cx, polled)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.write_timer.guard(this.limit, cx, polled)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_flush(cx);
        this.write_timer.guard(this.limit, cx, polled)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.write_timer.guard(this.limit, cx, polled)
    }
}

impl<S> std::fmt::Debug for IdleTimeout<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdleTimeout({}ms)", self.limit.as_millis())
    }
}

type ImapSession = Session<IdleTimeout<ImapStream>>;

// ---------- Connector ----------

/// Opens real IMAP sessions over TCP, TLS or STARTTLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncImapConnector;

#[async_trait]
impl Connector for AsyncImapConnector {
    type Session = AsyncImapSession;

    async fn connect(&self, config: &ImapConfig) -> Result<AsyncImapSession, ImapError> {
        let session = connect(config).await?;
        log::info!("IMAP connected to {}", config.label());
        Ok(AsyncImapSession {
            inner: Some(session),
            socket_timeout: config.socket_timeout(),
            label: config.label(),
        })
    }
}

/// Establish an IMAP connection and authenticate with LOGIN.
///
/// `secure` means implicit TLS; otherwise `starttls` upgrades a plain
/// connection before credentials are sent. Greeting and LOGIN share one
/// total deadline; every later command only has the idle deadline.
pub(crate) async fn connect(config: &ImapConfig) -> Result<ImapSession, ImapError> {
    if !config.secure && config.starttls {
        // The greeting is consumed during the upgrade, so this flow is separate.
        return connect_starttls(config).await;
    }

    let stream = connect_stream(config).await?;
    let client = Client::new(IdleTimeout::new(stream, config.socket_timeout()));
    with_timeout(config.greeting_timeout(), "greeting and LOGIN", authenticate(client, config)).await
}

// ---------- Session ----------

/// An authenticated async-imap session.
///
/// A command that stalls past the socket timeout leaves unread response
/// bytes behind, so the connection is dropped and every later call fails
/// with `ImapError::Closed`.
pub struct AsyncImapSession {
    inner: Option<ImapSession>,
    socket_timeout: Duration,
    label: String,
}

impl AsyncImapSession {
    fn session(&mut self) -> Result<&mut ImapSession, ImapError> {
        self.inner.as_mut().ok_or(ImapError::Closed)
    }

    fn settle<T>(&mut self, result: Result<T, ImapError>) -> Result<T, ImapError> {
        if let Err(ImapError::Timeout { operation, millis }) = &result {
            if self.inner.take().is_some() {
                log::warn!(
                    "IMAP {operation} to {} stalled for {millis}ms; dropping the connection",
                    self.label
                );
            }
        }
        result
    }
}

#[async_trait]
impl MailSession for AsyncImapSession {
    async fn list(&mut self) -> Result<Vec<MailboxInfo>, ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result: Result<Vec<MailboxInfo>, ImapError> = async {
            let names = session
                .list(Some(""), Some("*"))
                .await
                .map_err(|e| command_error("LIST", idle, e))?;
            let names: Vec<_> = names.collect::<Vec<_>>().await;

            let mut mailboxes = Vec::with_capacity(names.len());
            for name in names {
                let name = name.map_err(|e| command_error("LIST", idle, e))?;
                mailboxes.push(MailboxInfo::from_raw(name.name(), name.delimiter()));
            }
            Ok(mailboxes)
        }
        .await;
        self.settle(result)
    }

    async fn mailbox_open(&mut self, path: &str) -> Result<u32, ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result = session
            .select(path)
            .await
            .map_err(|e| command_error_in("SELECT", path, idle, e));
        let mailbox = self.settle(result)?;

        log::debug!(
            "IMAP SELECT {path}: exists={}, uidvalidity={}",
            mailbox.exists,
            mailbox.uid_validity.unwrap_or(0)
        );
        Ok(mailbox.exists)
    }

    async fn mailbox_create(&mut self, path: &str) -> Result<(), ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result = match session.create(path).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_exists(&e.to_string()) => Err(ImapError::AlreadyExists(path.to_string())),
            Err(e) => Err(command_error_in("CREATE", path, idle, e)),
        };
        self.settle(result)
    }

    async fn mailbox_delete(&mut self, path: &str) -> Result<(), ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result = session
            .delete(path)
            .await
            .map_err(|e| command_error_in("DELETE", path, idle, e));
        self.settle(result)
    }

    async fn status(&mut self, path: &str) -> Result<MailboxStatus, ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result = session
            .status(path, "(MESSAGES)")
            .await
            .map_err(|e| command_error_in("STATUS", path, idle, e));
        let mailbox = self.settle(result)?;
        Ok(MailboxStatus {
            messages: mailbox.exists,
        })
    }

    async fn search_all(&mut self, limit: usize) -> Result<Vec<MessageRef>, ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result = session
            .uid_search("ALL")
            .await
            .map_err(|e| command_error("UID SEARCH", idle, e));
        let uids = self.settle(result)?;
        Ok(refs_from_hits(uids, true, limit))
    }

    async fn fetch_one(
        &mut self,
        reference: MessageRef,
        options: FetchOptions,
    ) -> Result<Option<FetchedMessage>, ImapError> {
        let idle = self.socket_timeout;
        let operation = if reference.is_uid() { "UID FETCH" } else { "FETCH" };
        let query = options.query();
        let session = self.session()?;
        let result: Result<Option<FetchedMessage>, ImapError> = async {
            // UID FETCH and FETCH yield different stream types; collect each arm.
            let items = match reference {
                MessageRef::Uid(uid) => session
                    .uid_fetch(uid.to_string(), &query)
                    .await
                    .map_err(|e| command_error(operation, idle, e))?
                    .collect::<Vec<_>>()
                    .await,
                MessageRef::Sequence(seq) => session
                    .fetch(seq.to_string(), &query)
                    .await
                    .map_err(|e| command_error(operation, idle, e))?
                    .collect::<Vec<_>>()
                    .await,
            };

            let mut fetched = None;
            for item in items {
                match item {
                    Ok(fetch) if fetched.is_none() => {
                        fetched = Some(FetchedMessage {
                            size: fetch.size,
                            source: fetch.body().map(|b| b.to_vec()),
                        });
                    }
                    Ok(_) => {}
                    Err(e) if is_idle_timeout(&e) => return Err(command_error(operation, idle, e)),
                    Err(e) => log::warn!("IMAP fetch stream error for {reference}: {e}"),
                }
            }
            Ok(fetched)
        }
        .await;
        self.settle(result)
    }

    async fn fetch_headers(&mut self) -> Result<Vec<Vec<u8>>, ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result: Result<Vec<Vec<u8>>, ImapError> = async {
            let items = session
                .fetch("1:*", "BODY.PEEK[HEADER]")
                .await
                .map_err(|e| command_error("FETCH", idle, e))?
                .collect::<Vec<_>>()
                .await;

            let mut headers = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Ok(fetch) => headers.extend(fetch.header().map(|h| h.to_vec())),
                    Err(e) if is_idle_timeout(&e) => return Err(command_error("FETCH", idle, e)),
                    Err(e) => log::debug!("IMAP header fetch item skipped: {e}"),
                }
            }
            Ok(headers)
        }
        .await;
        self.settle(result)
    }

    async fn append(&mut self, path: &str, content: &[u8]) -> Result<(), ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result = session
            .append(path, None::<&str>, None::<&str>, content)
            .await
            .map_err(|e| command_error_in("APPEND", path, idle, e));
        self.settle(result)
    }

    async fn delete_messages(&mut self, references: &[MessageRef]) -> Result<(), ImapError> {
        if references.is_empty() {
            return Ok(());
        }
        let uid_set = join_set(references.iter().filter(|r| r.is_uid()));
        let seq_set = join_set(references.iter().filter(|r| !r.is_uid()));

        let idle = self.socket_timeout;
        let session = self.session()?;
        let result: Result<(), ImapError> = async {
            if !uid_set.is_empty() {
                let stream = session
                    .uid_store(&uid_set, "+FLAGS (\\Deleted)")
                    .await
                    .map_err(|e| command_error("UID STORE", idle, e))?;
                let _: Vec<_> = stream.collect().await;
            }
            if !seq_set.is_empty() {
                let stream = session
                    .store(&seq_set, "+FLAGS (\\Deleted)")
                    .await
                    .map_err(|e| command_error("STORE", idle, e))?;
                let _: Vec<_> = stream.collect().await;
            }

            let expunge_stream = session
                .expunge()
                .await
                .map_err(|e| command_error("EXPUNGE", idle, e))?;
            let _: Vec<_> = expunge_stream.collect().await;
            Ok(())
        }
        .await;
        self.settle(result)
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        let idle = self.socket_timeout;
        let session = self.session()?;
        let result = session.logout().await.map_err(|e| command_error("LOGOUT", idle, e));
        self.settle(result)?;
        self.inner = None;
        Ok(())
    }

    async fn close(&mut self) {
        if self.inner.take().is_some() {
            log::debug!("Dropped IMAP connection to {}", self.label);
        }
    }
}

// ---------- Internal helpers ----------

async fn with_timeout<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T, ImapError>
where
    F: Future<Output = Result<T, ImapError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ImapError::Timeout {
            operation,
            millis: limit.as_millis() as u64,
        }),
    }
}

fn is_idle_timeout(error: &async_imap::error::Error) -> bool {
    matches!(error, async_imap::error::Error::Io(e) if e.kind() == io::ErrorKind::TimedOut)
}

/// Map an async-imap failure. A stalled socket becomes `ImapError::Timeout`.
fn command_error(operation: &'static str, idle: Duration, error: async_imap::error::Error) -> ImapError {
    if is_idle_timeout(&error) {
        ImapError::Timeout {
            operation,
            millis: idle.as_millis() as u64,
        }
    } else {
        ImapError::command(operation, error)
    }
}

fn command_error_in(operation: &'static str, path: &str, idle: Duration, error: async_imap::error::Error) -> ImapError {
    match command_error(operation, idle, error) {
        ImapError::Command { operation, reason } => ImapError::command(operation, format!("{path}: {reason}")),
        other => other,
    }
}

fn join_set<'a>(references: impl Iterator<Item = &'a MessageRef>) -> String {
    references
        .map(|r| r.number().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Servers report an existing mailbox as `NO [ALREADYEXISTS]` (RFC 5530) or
/// with free text mentioning that it exists.
fn is_already_exists(reason: &str) -> bool {
    reason.to_ascii_uppercase().contains("EXISTS")
}

fn tls_connector(config: &ImapConfig) -> Result<tokio_native_tls::TlsConnector, ImapError> {
    let native_connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!config.tls_verify)
        .danger_accept_invalid_hostnames(!config.tls_verify)
        .build()
        .map_err(|e| ImapError::Tls {
            host: config.host.clone(),
            reason: format!("failed to create TLS connector: {e}"),
        })?;
    Ok(tokio_native_tls::TlsConnector::from(native_connector))
}

async fn tcp_connect(config: &ImapConfig) -> Result<TcpStream, ImapError> {
    let addr = (&*config.host, config.port);
    let connect_error = |reason: String| ImapError::Connect {
        host: config.host.clone(),
        port: config.port,
        reason,
    };

    tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| connect_error(format!("timed out after {}ms", config.connect_timeout_ms)))?
        .map_err(|e| connect_error(e.to_string()))
}

/// Establish TCP + TLS (implicit) or plain stream.
async fn connect_stream(config: &ImapConfig) -> Result<ImapStream, ImapError> {
    let tcp = tcp_connect(config).await?;
    if !config.secure {
        return Ok(ImapStream::Plain(tcp));
    }

    let tls_connector = tls_connector(config)?;
    let tls = tokio::time::timeout(config.connect_timeout(), tls_connector.connect(&config.host, tcp))
        .await
        .map_err(|_| ImapError::Tls {
            host: config.host.clone(),
            reason: format!("handshake timed out after {}ms", config.connect_timeout_ms),
        })?
        .map_err(|e| ImapError::Tls {
            host: config.host.clone(),
            reason: e.to_string(),
        })?;
    Ok(ImapStream::Tls(tls))
}

/// Handle STARTTLS connection: connect plain, upgrade to TLS, then authenticate.
///
/// STARTTLS is special because we must issue the STARTTLS command on the plain
/// connection, upgrade the underlying TCP stream to TLS, and then create a new
/// Client on the TLS stream for authentication.
async fn connect_starttls(config: &ImapConfig) -> Result<ImapSession, ImapError> {
    let mut tcp = tcp_connect(config).await?;
    let greeting_timeout = config.greeting_timeout();

    let mut buf = vec![0u8; 4096];
    let greeting = with_timeout(greeting_timeout, "greeting", async {
        let n = tcp
            .read(&mut buf)
            .await
            .map_err(|e| ImapError::command("greeting", e))?;
        Ok(String::from_utf8_lossy(&buf[..n]).to_string())
    })
    .await?;
    if !greeting.contains("OK") {
        return Err(ImapError::command("greeting", format!("unexpected server greeting: {greeting}")));
    }

    let response = with_timeout(greeting_timeout, "STARTTLS", async {
        tcp.write_all(b"a001 STARTTLS\r\n")
            .await
            .map_err(|e| ImapError::command("STARTTLS", e))?;
        let n = tcp
            .read(&mut buf)
            .await
            .map_err(|e| ImapError::command("STARTTLS", e))?;
        Ok(String::from_utf8_lossy(&buf[..n]).to_string())
    })
    .await?;
    if !response.contains("OK") {
        return Err(ImapError::command("STARTTLS", format!("rejected: {response}")));
    }

    let tls_connector = tls_connector(config)?;
    let tls = tokio::time::timeout(config.connect_timeout(), tls_connector.connect(&config.host, tcp))
        .await
        .map_err(|_| ImapError::Tls {
            host: config.host.clone(),
            reason: format!("upgrade after STARTTLS timed out after {}ms", config.connect_timeout_ms),
        })?
        .map_err(|e| ImapError::Tls {
            host: config.host.clone(),
            reason: format!("upgrade after STARTTLS failed: {e}"),
        })?;

    let client = Client::new(IdleTimeout::new(ImapStream::Tls(tls), config.socket_timeout()));
    with_timeout(greeting_timeout, "LOGIN", authenticate(client, config)).await
}

async fn authenticate(client: Client<IdleTimeout<ImapStream>>, config: &ImapConfig) -> Result<ImapSession, ImapError> {
    client
        .login(&config.username, &config.password)
        .await
        .map_err(|(e, _)| ImapError::Auth(format!("login for {} rejected: {e}", config.username)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_already_exists() {
        assert!(is_already_exists("No Response: [ALREADYEXISTS] Mailbox exists"));
        assert!(is_already_exists("NO Mailbox already exists"));
        assert!(!is_already_exists("NO [NOPERM] Permission denied"));
    }

    #[test]
    fn test_join_set() {
        let refs = [MessageRef::Uid(4), MessageRef::Sequence(2), MessageRef::Uid(9)];
        assert_eq!(join_set(refs.iter().filter(|r| r.is_uid())), "4,9");
        assert_eq!(join_set(refs.iter().filter(|r| !r.is_uid())), "2");
    }

    #[tokio::test]
    async fn test_with_timeout_reports_operation() {
        let result: Result<(), ImapError> = with_timeout(Duration::from_millis(5), "NOOP", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result.unwrap_err(),
            ImapError::Timeout {
                operation: "NOOP",
                millis: 5
            }
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let mut config = ImapConfig::new("127.0.0.1", 1, "user", "pass");
        config.secure = false;
        config.connect_timeout_ms = 2_000;
        match AsyncImapConnector.connect(&config).await {
            Err(ImapError::Connect { host, port, .. }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 1);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connection to port 1 should fail"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_rearms_while_data_keeps_moving() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = IdleTimeout::new(client, Duration::from_millis(100));
        let line = b"* OK still here\r\n";
        tokio::spawn(async move {
            for byte in line {
                tokio::time::sleep(Duration::from_millis(40)).await;
                server.write_all(&[*byte]).await.unwrap();
            }
        });

        // Well over the limit in total, but never idle for that long.
        let mut received = vec![0u8; line.len()];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, line);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_fires_on_silent_peer() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = IdleTimeout::new(client, Duration::from_millis(100));

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    /// A one-connection IMAP server on localhost. LOGIN is accepted at once;
    /// every other command gets `reply(tag)` written one byte per
    /// `byte_delay`, or silence when `reply` returns `None`.
    async fn scripted_server(reply: fn(&str) -> Option<String>, byte_delay: Duration) -> u16 {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            socket.set_nodelay(true).unwrap();
            let (read, mut write) = socket.into_split();
            write.write_all(b"* OK test server ready\r\n").await.unwrap();

            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let tag = line.split_whitespace().next().unwrap_or("*").to_string();
                if line.contains("LOGIN") {
                    write.write_all(format!("{tag} OK LOGIN completed\r\n").as_bytes()).await.unwrap();
                    continue;
                }
                let Some(response) = reply(&tag) else { continue };
                for byte in response.as_bytes() {
                    tokio::time::sleep(byte_delay).await;
                    if write.write_all(&[*byte]).await.is_err() {
                        return;
                    }
                }
            }
        });
        port
    }

    fn local_config(port: u16, socket_timeout_ms: u64) -> ImapConfig {
        let mut config = ImapConfig::new("127.0.0.1", port, "user", "pass");
        config.secure = false;
        config.socket_timeout_ms = socket_timeout_ms;
        config
    }

    #[tokio::test]
    async fn test_slow_fetch_response_completes() {
        fn size_reply(tag: &str) -> Option<String> {
            Some(format!("* 1 FETCH (UID 1 RFC822.SIZE 2048)\r\n{tag} OK FETCH completed\r\n"))
        }
        let port = scripted_server(size_reply, Duration::from_millis(10)).await;
        let mut session = AsyncImapConnector.connect(&local_config(port, 150)).await.unwrap();

        let fetched = session
            .fetch_one(MessageRef::Uid(1), FetchOptions::size_only())
            .await
            .unwrap()
            .expect("one FETCH item");
        assert_eq!(fetched.size, Some(2048));
        assert!(session.inner.is_some());
    }

    #[tokio::test]
    async fn test_stalled_command_drops_the_session() {
        fn no_reply(_: &str) -> Option<String> {
            None
        }
        let port = scripted_server(no_reply, Duration::ZERO).await;
        let mut session = AsyncImapConnector.connect(&local_config(port, 150)).await.unwrap();

        let err = session
            .fetch_one(MessageRef::Uid(1), FetchOptions::size_only())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ImapError::Timeout {
                operation: "UID FETCH",
                millis: 150
            }
        );
        assert!(session.inner.is_none());
        assert_eq!(session.list().await.unwrap_err(), ImapError::Closed);
    }
}
