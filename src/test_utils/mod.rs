//! Utilities to help with testing pgorb
//!
//! The centerpiece is [FakeBackend]: an in-memory imitation of a PostgreSQL
//! server, speaking just enough of the protocol to exercise the pooler.
//! Queries it understands:
//!
//! - `BEGIN`, `COMMIT`, `ROLLBACK`: transaction control.
//! - `SELECT pg_sleep(..)`: never finishes, unless cancelled.
//! - `COPY .. FROM STDIN` / `COPY .. TO STDOUT`: copy-in and copy-out.
//! - `FAIL`: returns an error.
//! - Anything else completes immediately.

use crate::backend::{self, Backend, BoxedIo, Connector};
use crate::protocol::{self, CancelKey, Message, StartupPacket, Tag, TransactionStatus};
use crate::server::{Detached, ServerConnection};
use crate::stream::PgStream;
use crate::tls::Tls;
use crate::ServerId;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::Notify;

pub(crate) fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Parses a single message out of `bytes`.
pub(crate) fn message(bytes: &[u8]) -> Message {
    let mut buf = BytesMut::from(bytes);
    protocol::split_message(&mut buf)
        .unwrap()
        .expect("Incomplete message")
}

/// A parked server connection, whose backend end is returned alongside it.
pub(crate) fn detached_server() -> (Detached, DuplexStream) {
    let (a, b) = tokio::io::duplex(1024);
    let io: BoxedIo = Box::new(a);
    (
        ServerConnection::new(ServerId::new(), PgStream::new(io)).detach(),
        b,
    )
}

#[derive(Default)]
struct State {
    next_pid: u32,
    startups: Vec<(String, String)>,
    // The pid of the session running each query, and the query itself.
    queries: Vec<(u32, String)>,
    cancels: Vec<CancelKey>,
    terminates: usize,
    sleepers: HashMap<u32, (u32, Arc<Notify>)>,

    reject_startup: bool,
    stall_startup: bool,
    ignore_cancels: bool,
    password: Option<String>,
}

/// An in-memory PostgreSQL server.
#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<State>>,
    cancelled: Arc<Notify>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Answers every StartupMessage with an error.
    pub(crate) fn reject_startup(&self) {
        self.lock().reject_startup = true;
    }

    /// Never answers a StartupMessage.
    pub(crate) fn stall_startup(&self) {
        self.lock().stall_startup = true;
    }

    /// Records cancel requests, but doesn't act on them.
    pub(crate) fn ignore_cancels(&self) {
        self.lock().ignore_cancels = true;
    }

    /// Asks for a cleartext password during startup.
    pub(crate) fn require_password(&self, password: &str) {
        self.lock().password = Some(password.to_string());
    }

    /// The (database, user) of every StartupMessage received.
    pub(crate) fn startups(&self) -> Vec<(String, String)> {
        self.lock().startups.clone()
    }

    /// Every simple query received, across all sessions.
    pub(crate) fn queries(&self) -> Vec<String> {
        self.lock().queries.iter().map(|(_, sql)| sql.clone()).collect()
    }

    /// The pid of the backend session which ran each simple query.
    pub(crate) fn query_pids(&self) -> Vec<u32> {
        self.lock().queries.iter().map(|(pid, _)| *pid).collect()
    }

    pub(crate) fn cancels(&self) -> usize {
        self.lock().cancels.len()
    }

    pub(crate) fn cancel_keys(&self) -> Vec<CancelKey> {
        self.lock().cancels.clone()
    }

    pub(crate) fn terminates(&self) -> usize {
        self.lock().terminates
    }

    pub(crate) async fn wait_for_cancels(&self, count: usize) {
        loop {
            let notified = self.cancelled.notified();
            if self.cancels() >= count {
                return;
            }
            notified.await;
        }
    }

    fn cancel(&self, key: CancelKey) {
        let mut state = self.lock();
        state.cancels.push(key);
        if !state.ignore_cancels {
            if let Some((secret, sleeper)) = state.sleepers.get(&key.pid) {
                if *secret == key.secret {
                    sleeper.notify_one();
                }
            }
        }
        drop(state);
        self.cancelled.notify_waiters();
    }

    /// Serves one connection, until the peer hangs up.
    pub(crate) async fn serve(self, io: BoxedIo) -> std::io::Result<()> {
        let mut stream = PgStream::new(io);
        let startup = loop {
            let packet = stream.read_startup().await?;
            match protocol::parse_startup(&packet)? {
                StartupPacket::SslRequest | StartupPacket::GssEncRequest => {
                    stream.send(b"N").await?;
                }
                StartupPacket::Cancel(key) => {
                    self.cancel(key);
                    return Ok(());
                }
                StartupPacket::Startup(startup) => break startup,
            }
        };

        let (stall, reject, password) = {
            let state = self.lock();
            (state.stall_startup, state.reject_startup, state.password.clone())
        };
        if stall {
            return std::future::pending().await;
        }
        self.lock().startups.push((
            startup.database().unwrap_or_default().to_string(),
            startup.user().unwrap_or_default().to_string(),
        ));
        if reject {
            protocol::put_error_response(
                stream.write_buf(),
                "FATAL",
                "28000",
                "role does not exist",
            );
            return stream.flush().await;
        }
        if let Some(expected) = password {
            protocol::put_authentication(stream.write_buf(), 3);
            stream.flush().await?;
            let msg = stream.read_message().await?;
            if msg.tag() != Tag::PASSWORD || protocol::password(&msg)? != expected {
                protocol::put_error_response(
                    stream.write_buf(),
                    "FATAL",
                    "28P01",
                    "password authentication failed",
                );
                return stream.flush().await;
            }
        }

        let key = {
            let mut state = self.lock();
            state.next_pid += 1;
            CancelKey {
                pid: state.next_pid,
                secret: state.next_pid * 7 + 1,
            }
        };
        let sleeper = Arc::new(Notify::new());
        self.lock()
            .sleepers
            .insert(key.pid, (key.secret, sleeper.clone()));

        protocol::put_authentication(stream.write_buf(), 0);
        protocol::put_parameter_status(stream.write_buf(), "server_version", "16.0");
        protocol::put_backend_key_data(stream.write_buf(), key);
        protocol::put_ready_for_query(stream.write_buf(), TransactionStatus::Idle);
        stream.flush().await?;

        let mut session = Session {
            stream,
            pid: key.pid,
            sleeper,
            status: TransactionStatus::Idle,
        };
        let result = session.run(&self).await;
        self.lock().sleepers.remove(&key.pid);
        result
    }
}

struct Session {
    stream: PgStream<BoxedIo>,
    pid: u32,
    sleeper: Arc<Notify>,
    status: TransactionStatus,
}

fn put_message(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.put_u8(tag);
    buf.put_u32(body.len() as u32 + 4);
    buf.put_slice(body);
}

fn put_command_complete(buf: &mut BytesMut, command: &str) {
    let mut body = command.as_bytes().to_vec();
    body.push(0);
    put_message(buf, b'C', &body);
}

impl Session {
    async fn run(&mut self, backend: &FakeBackend) -> std::io::Result<()> {
        loop {
            let msg = self.stream.read_message().await?;
            match msg.tag().as_u8() {
                b'Q' => {
                    let sql = String::from_utf8_lossy(msg.body())
                        .trim_end_matches('\0')
                        .to_string();
                    backend.lock().queries.push((self.pid, sql.clone()));
                    self.query(&sql).await?;
                }
                // Extended protocol: Parse, Bind, Describe, Execute
                b'P' => put_message(self.stream.write_buf(), b'1', &[]),
                b'B' => put_message(self.stream.write_buf(), b'2', &[]),
                b'D' => put_message(self.stream.write_buf(), b'n', &[]),
                b'E' => put_command_complete(self.stream.write_buf(), "SELECT 1"),
                b'H' => self.stream.flush().await?,
                b'S' => {
                    protocol::put_ready_for_query(self.stream.write_buf(), self.status);
                    self.stream.flush().await?;
                }
                b'X' => {
                    backend.lock().terminates += 1;
                    return Ok(());
                }
                _ => (),
            }
        }
    }

    fn ready(&mut self) {
        protocol::put_ready_for_query(self.stream.write_buf(), self.status);
    }

    fn error(&mut self, code: &str, message: &str) {
        protocol::put_error_response(self.stream.write_buf(), "ERROR", code, message);
        if self.status == TransactionStatus::InTransaction {
            self.status = TransactionStatus::Failed;
        }
    }

    async fn query(&mut self, sql: &str) -> std::io::Result<()> {
        let upper = sql.to_ascii_uppercase();
        if upper.starts_with("BEGIN") {
            self.status = TransactionStatus::InTransaction;
            put_command_complete(self.stream.write_buf(), "BEGIN");
        } else if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
            self.status = TransactionStatus::Idle;
            put_command_complete(self.stream.write_buf(), "COMMIT");
        } else if upper.starts_with("SELECT PG_SLEEP") {
            self.stream.flush().await?;
            self.sleeper.notified().await;
            self.error("57014", "canceling statement due to user request");
        } else if upper.starts_with("COPY") && upper.contains("FROM STDIN") {
            // Text format, no columns
            put_message(self.stream.write_buf(), b'G', &[0, 0, 0]);
            self.stream.flush().await?;
            let mut rows = 0;
            loop {
                let msg = self.stream.read_message().await?;
                match msg.tag() {
                    Tag::COPY_DATA => rows += 1,
                    Tag::COPY_DONE => {
                        put_command_complete(self.stream.write_buf(), &format!("COPY {rows}"));
                        break;
                    }
                    Tag::COPY_FAIL => {
                        self.error("57014", "COPY from stdin failed");
                        break;
                    }
                    _ => (),
                }
            }
        } else if upper.starts_with("COPY") && upper.contains("TO STDOUT") {
            put_message(self.stream.write_buf(), b'H', &[0, 0, 0]);
            put_message(self.stream.write_buf(), b'd', b"row\n");
            put_message(self.stream.write_buf(), b'c', &[]);
            put_command_complete(self.stream.write_buf(), "COPY 1");
        } else if upper.starts_with("FAIL") {
            self.error("42601", "syntax error");
        } else if upper.starts_with("SELECT") {
            // One row, one column
            put_message(self.stream.write_buf(), b'D', &[0, 1, 0, 0, 0, 1, b'1']);
            put_command_complete(self.stream.write_buf(), "SELECT 1");
        } else {
            put_command_complete(self.stream.write_buf(), "SET");
        }
        self.ready();
        self.stream.flush().await
    }
}

/// A connector which reaches a [FakeBackend].
pub(crate) struct FakeConnector {
    backend: FakeBackend,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl FakeConnector {
    pub(crate) fn new(backend: FakeBackend) -> Self {
        Self {
            backend,
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        }
    }

    /// The number of connections made, including those carrying cancel
    /// requests.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Makes every future connection attempt fail.
    pub(crate) fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _backend: &Backend) -> Result<BoxedIo, backend::Error> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let backend = self.backend.clone();
        tokio::task::spawn(async move {
            let _ = backend.serve(Box::new(theirs)).await;
        });
        Ok(Box::new(ours))
    }
}

/// A [Tls] implementation which does no encryption at all, but counts
/// handshakes.
#[derive(Default)]
pub(crate) struct PlainTls {
    pub(crate) accepts: AtomicUsize,
    pub(crate) connects: AtomicUsize,
}

#[async_trait]
impl Tls for PlainTls {
    async fn connect(&self, io: BoxedIo, _host: &str) -> std::io::Result<BoxedIo> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(io)
    }

    async fn accept(&self, io: BoxedIo) -> std::io::Result<BoxedIo> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(io)
    }
}

/// The client side of a session with the pooler.
pub(crate) struct TestClient {
    pub(crate) stream: PgStream<DuplexStream>,
    pub(crate) key: Option<CancelKey>,
}

impl TestClient {
    pub(crate) fn new(io: DuplexStream) -> Self {
        Self {
            stream: PgStream::new(io),
            key: None,
        }
    }

    /// Sends a StartupMessage, and reads the pooler's reply up to the first
    /// ReadyForQuery (or an error).
    pub(crate) async fn startup(&mut self, params: &[(&str, &str)]) -> Vec<Message> {
        protocol::put_startup_message(self.stream.write_buf(), params);
        self.stream.flush().await.unwrap();
        let replies = self.read_until_ready().await;
        for msg in &replies {
            if msg.tag() == Tag::BACKEND_KEY_DATA {
                self.key = Some(protocol::backend_key(msg).unwrap());
            }
        }
        replies
    }

    /// Reads messages until a ReadyForQuery, an ErrorResponse which ends the
    /// connection, or EOF.
    pub(crate) async fn read_until_ready(&mut self) -> Vec<Message> {
        let mut replies = vec![];
        while let Ok(msg) = self.stream.read_message().await {
            let tag = msg.tag();
            replies.push(msg);
            if tag == Tag::READY_FOR_QUERY {
                break;
            }
        }
        replies
    }

    /// Runs a simple query, returning every reply up to ReadyForQuery.
    pub(crate) async fn query(&mut self, sql: &str) -> Vec<Message> {
        self.send_query(sql).await;
        self.read_until_ready().await
    }

    pub(crate) async fn send_query(&mut self, sql: &str) {
        protocol::put_query(self.stream.write_buf(), sql);
        self.stream.flush().await.unwrap();
    }

    pub(crate) async fn send_raw(&mut self, tag: u8, body: &[u8]) {
        put_message(self.stream.write_buf(), tag, body);
        self.stream.flush().await.unwrap();
    }

    pub(crate) async fn terminate(mut self) {
        protocol::put_terminate(self.stream.write_buf());
        let _ = self.stream.flush().await;
    }
}

/// Returns the transaction status of the last ReadyForQuery in `replies`.
pub(crate) fn last_status(replies: &[Message]) -> Option<TransactionStatus> {
    replies
        .iter()
        .rev()
        .find(|msg| msg.tag() == Tag::READY_FOR_QUERY)
        .and_then(|msg| protocol::ready_status(msg).ok())
}

/// Returns the SQLSTATE of the first ErrorResponse in `replies`.
pub(crate) fn error_code(replies: &[Message]) -> Option<String> {
    replies
        .iter()
        .find(|msg| msg.tag() == Tag::ERROR_RESPONSE)
        .map(|msg| protocol::error_fields(msg).code)
}
