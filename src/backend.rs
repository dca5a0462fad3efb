//! The interface for connecting to backends, and the lifecycle of a
//! connection to a backend.
//!
//! A backend connection is established in a few steps:
//!
//! 1. [Connector::connect] opens the transport (TCP, possibly TLS).
//! 2. A StartupMessage names the route's database and user.
//! 3. The backend authenticates us, reports its parameters and cancel key,
//!    and finally reports that it is ready for queries.
//!
//! Before a client uses the connection, [configure] applies the client's
//! startup parameters. Once the client is done with it, [reset] decides if
//! the connection may be handed to another client.

use crate::auth::SharedAuthenticator;
use crate::policy::{Rule, Storage};
use crate::protocol::{self, CancelKey, ErrorFields, Startup, Tag};
use crate::route::RouteId;
use crate::server::ServerConnection;
use crate::stream::PgStream;
use crate::ServerId;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{event, instrument, Level};

// How long to wait for a returned server to become ready, before
// cancelling whatever it is doing.
const RESET_WAIT: Duration = Duration::from_secs(1);

// How many cancel requests are sent while resetting a server, before it is
// given up on.
const RESET_CANCEL_LIMIT: usize = 1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Protocol error")]
    Protocol(#[from] protocol::Error),

    #[error("Server returned an error: {0}")]
    Server(ErrorFields),

    #[error("Unexpected message from server: {0}")]
    Unexpected(Tag),

    #[error("Failed to authenticate with server")]
    Auth(#[from] crate::auth::Error),

    #[error("Timed out connecting to server")]
    Timeout,

    #[error("Server refused TLS")]
    TlsRefused,

    #[error(transparent)]
    Other(anyhow::Error),
}

impl Error {
    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::Protocol(_) => "Protocol",
            Error::Server(_) => "Server",
            Error::Unexpected(_) => "Unexpected",
            Error::Auth(_) => "Auth",
            Error::Timeout => "Timeout",
            Error::TlsRefused => "TlsRefused",
            Error::Other(_) => "Other",
        }
    }
}

/// The address of a backend.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn new(host: impl ToString, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl From<&Storage> for Backend {
    fn from(storage: &Storage) -> Self {
        Self::new(&storage.host, storage.port)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Interface for raw connections, to clients or to backends.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedIo = Box<dyn Io>;

/// Describes how a connection to a Backend should be constructed.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Creates a connection to a backend.
    ///
    /// The returned connection must be ready to carry the PostgreSQL
    /// protocol, which means TLS (if any) has already been negotiated.
    async fn connect(&self, backend: &Backend) -> Result<BoxedIo, Error>;
}

pub type SharedConnector = Arc<dyn Connector>;

/// Everything needed to open connections to backends.
#[derive(Clone)]
pub struct Dialer {
    pub(crate) connector: SharedConnector,
    pub(crate) auth: SharedAuthenticator,
    pub(crate) connect_timeout: Duration,
}

impl Dialer {
    pub fn new(
        connector: SharedConnector,
        auth: SharedAuthenticator,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            auth,
            connect_timeout,
        }
    }

    /// Opens a new connection for a route, and waits until the backend is
    /// ready for queries.
    #[instrument(skip(self, rule), fields(route = %route), name = "Dialer::connect")]
    pub(crate) async fn connect(
        &self,
        id: ServerId,
        route: &RouteId,
        rule: &Rule,
    ) -> Result<ServerConnection, Error> {
        tokio::time::timeout(self.connect_timeout, self.connect_inner(id, route, rule))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn connect_inner(
        &self,
        id: ServerId,
        route: &RouteId,
        rule: &Rule,
    ) -> Result<ServerConnection, Error> {
        let backend = Backend::from(&rule.storage);
        let io = self.connector.connect(&backend).await?;
        let mut server = ServerConnection::new(id, PgStream::new(io));

        let database = route.database_lossy();
        let user = route.user_lossy();
        server.startup(&[("user", &user), ("database", &database)]).await?;
        self.setup(&mut server, rule).await?;

        event!(
            Level::DEBUG,
            server = %id,
            backend = %backend,
            pid = server.key().pid,
            "Server is ready"
        );
        Ok(server)
    }

    // Reads everything the backend sends after the StartupMessage, up to and
    // including the first ReadyForQuery.
    async fn setup(&self, server: &mut ServerConnection, rule: &Rule) -> Result<(), Error> {
        loop {
            let msg = server.read_message().await?;
            match msg.tag() {
                Tag::READY_FOR_QUERY => {
                    server.ready(&msg)?;
                    return Ok(());
                }
                Tag::AUTHENTICATION => {
                    if protocol::auth_code(&msg)? == 0 {
                        continue;
                    }
                    self.auth
                        .authenticate_server(server.stream_mut(), &msg, rule)
                        .await?;
                }
                Tag::BACKEND_KEY_DATA => {
                    server.set_key(protocol::backend_key(&msg)?);
                }
                Tag::PARAMETER_STATUS => {
                    server.record_parameter(&msg)?;
                }
                Tag::NOTICE_RESPONSE => (),
                Tag::ERROR_RESPONSE => {
                    return Err(Error::Server(protocol::error_fields(&msg)));
                }
                tag => return Err(Error::Unexpected(tag)),
            }
        }
    }

    /// Asks a backend to cancel whatever query is running under `key`.
    #[instrument(skip(self), name = "Dialer::cancel")]
    pub(crate) async fn cancel(&self, backend: &Backend, key: CancelKey) -> Result<(), Error> {
        tokio::time::timeout(
            self.connect_timeout,
            crate::cancel::cancel(self.connector.as_ref(), backend, key),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }
}

// Parameter names end up inside SQL, so only plain identifiers are
// allowed through.
fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

/// Builds the statement which applies a client's startup parameters to a
/// server.
pub(crate) fn configure_query(startup: &Startup) -> String {
    let mut sql = String::new();
    for (name, value) in startup.options() {
        if !is_plain_identifier(name) {
            event!(Level::WARN, name, "Ignoring startup parameter");
            continue;
        }
        sql.push_str(&format!("SET {name}='{}';", value.replace('\'', "''")));
    }
    sql
}

/// Applies a client's startup parameters to a server.
///
/// Does nothing if the client asked for no parameters.
#[instrument(skip_all, fields(server = %server.id()), name = "backend::configure")]
pub(crate) async fn configure(server: &mut ServerConnection, startup: &Startup) -> Result<(), Error> {
    let sql = configure_query(startup);
    if sql.is_empty() {
        return Ok(());
    }
    server.query(&sql).await
}

/// The outcome of [reset].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reset {
    /// The server may be handed to another client.
    Reusable,

    /// The server must be closed.
    Drop,
}

/// Returns a server to a clean state, once a client is done with it.
///
/// Waits for in-flight queries to finish (cancelling them if they take
/// too long), rolls back open transactions, and optionally discards session
/// state, according to the route's rule.
#[instrument(skip_all, fields(server = %server.id()), name = "backend::reset")]
pub(crate) async fn reset(
    server: &mut ServerConnection,
    rule: &Rule,
    dialer: &Dialer,
) -> Result<Reset, Error> {
    if server.is_copy() {
        event!(Level::DEBUG, "Dropping server in the middle of a COPY");
        return Ok(Reset::Drop);
    }
    if server.is_transaction() && !rule.pool_rollback {
        event!(Level::DEBUG, "Dropping server with an open transaction");
        return Ok(Reset::Drop);
    }
    if !server.is_synchronized() && !rule.pool_cancel {
        event!(Level::DEBUG, "Dropping server with queries in flight");
        return Ok(Reset::Drop);
    }

    let mut cancels = 0;
    while !server.is_synchronized() {
        match tokio::time::timeout(RESET_WAIT, server.read_message()).await {
            Ok(msg) => {
                let msg = msg?;
                server.observe(&msg)?;
            }
            Err(_) => {
                if cancels >= RESET_CANCEL_LIMIT {
                    event!(Level::WARN, "Server did not become ready after cancel");
                    return Ok(Reset::Drop);
                }
                cancels += 1;
                let backend = Backend::from(&rule.storage);
                if let Err(err) = dialer.cancel(&backend, server.key()).await {
                    event!(Level::WARN, ?err, "Failed to cancel query on server");
                    return Ok(Reset::Drop);
                }
            }
        }
    }

    if server.is_copy() {
        return Ok(Reset::Drop);
    }
    if rule.pool_rollback && server.is_transaction() {
        server.query("ROLLBACK").await?;
    }
    if rule.pool_discard {
        server.query("DISCARD ALL").await?;
    }
    Ok(Reset::Reusable)
}
