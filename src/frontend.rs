//! Client sessions: startup, authentication, and the relay loop.
//!
//! Each accepted client runs [run] in a task of its own. After the startup
//! handshake, the session reads client messages one at a time and forwards
//! them to an attached server. Whenever a message expects a ReadyForQuery,
//! the session relays server replies until the server is synchronized
//! again, which is where the pooling mode decides whether to give the
//! server back. After a Flush, replies are relayed as they arrive, while
//! the session keeps reading the client.

use crate::auth::{self, SharedAuthenticator};
use crate::backend::{self, BoxedIo, Dialer, Reset};
use crate::claim::{Handle, Ticket};
use crate::policy::PoolingMode;
#[cfg(feature = "probes")]
use crate::probes;
use crate::protocol::{self, CancelKey, Message, Startup, StartupPacket, Tag, TransactionStatus};
use crate::router::{self, Router};
use crate::stream::PgStream;
use crate::tls::SharedTls;
use crate::ClientId;

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{event, instrument, Level};

// How long to wait on a backend before checking if the client is still
// connected.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("Failed during startup")]
    Startup(#[source] io::Error),

    #[error("Invalid startup packet")]
    Protocol(#[from] protocol::Error),

    #[error("Client sent data before the TLS handshake")]
    BufferedTls,

    #[error("Failed to route client")]
    Route(#[source] router::Error),

    #[error("Failed to authenticate client")]
    Auth(#[from] auth::Error),

    #[error("Failed to attach server")]
    Attach(#[source] router::Error),

    #[error("Failed to configure server")]
    ServerConfigure(#[source] backend::Error),

    #[error("Failed to reset server")]
    ServerReset(#[source] backend::Error),

    #[error("Failed to read from server")]
    ServerRead(#[source] io::Error),

    #[error("Failed to write to server")]
    ServerWrite(#[source] io::Error),

    #[error("Failed to read from client")]
    ClientRead(#[source] io::Error),

    #[error("Failed to write to client")]
    ClientWrite(#[source] io::Error),
}

/// Everything a session needs from the pooler.
pub(crate) struct Context {
    pub(crate) router: Router,
    pub(crate) dialer: Dialer,
    pub(crate) auth: SharedAuthenticator,
    pub(crate) tls: Option<SharedTls>,
    pub(crate) pipelining: usize,
}

/// Serves one client connection until it ends.
#[instrument(skip_all, fields(client = %id), name = "frontend::run")]
pub(crate) async fn run(ctx: &Context, id: ClientId, io: BoxedIo) {
    event!(Level::DEBUG, "Client connected");
    match session(ctx, id, io).await {
        Ok(()) => event!(Level::DEBUG, "Client disconnected"),
        Err(err) => event!(Level::INFO, ?err, "Client session failed"),
    }
}

fn put_fatal(client: &mut PgStream<BoxedIo>, code: &str, message: &str) {
    protocol::put_error_response(client.write_buf(), "FATAL", code, message);
}

async fn session(ctx: &Context, id: ClientId, io: BoxedIo) -> Result<(), Error> {
    let Some((mut client, startup)) = startup(ctx, io).await? else {
        return Ok(());
    };
    let user = startup.user().unwrap_or_default();
    let database = startup.database().unwrap_or_default();

    let key = CancelKey::generate(id);
    let ticket = match ctx.router.route(id, key, database, user).await {
        Ok(ticket) => ticket,
        Err(err) => {
            let (code, message) = match err {
                router::Error::RouteNotFound => ("3D000", "route for database and user not found"),
                router::Error::LimitReached => ("53300", "too many connections"),
                _ => ("08006", "failed to route client"),
            };
            put_fatal(&mut client, code, message);
            let _ = client.flush().await;
            return Err(Error::Route(err));
        }
    };

    if let Err(err) = ctx
        .auth
        .authenticate_client(&mut client, &startup, ticket.rule())
        .await
    {
        let _ = client.flush().await;
        return Err(err.into());
    }
    protocol::put_backend_key_data(client.write_buf(), key);
    protocol::put_ready_for_query(client.write_buf(), TransactionStatus::Idle);
    client.flush().await.map_err(Error::ClientWrite)?;

    event!(Level::DEBUG, route = %ticket.route_id(), "Client ready");
    let mut session = Session {
        ctx,
        client,
        startup,
        ticket,
        server: None,
        flushed: false,
    };
    let result = session.relay().await;
    session.cleanup(result).await
}

// Handles everything before the StartupMessage: TLS negotiation and cancel
// requests.
//
// Returns None if the connection was only carrying a cancel request.
async fn startup(
    ctx: &Context,
    io: BoxedIo,
) -> Result<Option<(PgStream<BoxedIo>, Startup)>, Error> {
    let mut client = PgStream::new(io);
    loop {
        let packet = client.read_startup().await.map_err(Error::Startup)?;
        let packet = match protocol::parse_startup(&packet) {
            Ok(packet) => packet,
            Err(err) => {
                put_fatal(&mut client, "08P01", &err.to_string());
                let _ = client.flush().await;
                return Err(err.into());
            }
        };
        match packet {
            StartupPacket::SslRequest => match &ctx.tls {
                Some(tls) => {
                    client.send(b"S").await.map_err(Error::Startup)?;
                    let io = client.into_inner().map_err(|_| Error::BufferedTls)?;
                    let io = tls.accept(io).await.map_err(Error::Startup)?;
                    client = PgStream::new(io);
                }
                None => client.send(b"N").await.map_err(Error::Startup)?,
            },
            StartupPacket::GssEncRequest => client.send(b"N").await.map_err(Error::Startup)?,
            StartupPacket::Cancel(key) => {
                let _ = ctx.router.cancel(key).await;
                return Ok(None);
            }
            StartupPacket::Startup(startup) => return Ok(Some((client, startup))),
        }
    }
}

struct Session<'a> {
    ctx: &'a Context,
    client: PgStream<BoxedIo>,
    startup: Startup,
    ticket: Ticket,
    server: Option<Handle>,
    // Set once a Flush has been forwarded, until the next request which
    // expects a ReadyForQuery.
    flushed: bool,
}

// What the relay loop reads next.
enum Incoming {
    Client(Message),
    Server(Message),
}

// Reads from a server, checking on the client whenever the server takes
// longer than the watchdog interval.
async fn read_server(server: &mut Handle, client: &mut PgStream<BoxedIo>) -> Result<Message, Error> {
    loop {
        match timeout(WATCHDOG_INTERVAL, server.read_message()).await {
            Ok(result) => return result.map_err(Error::ServerRead),
            Err(_) => {
                if !client.is_connected() {
                    return Err(Error::ClientRead(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "client disconnected while waiting for server",
                    )));
                }
            }
        }
    }
}

impl Session<'_> {
    // Reads the next client message. After a Flush, whatever the server
    // sends in the meantime is read too.
    async fn next(&mut self) -> Result<Incoming, Error> {
        let server = match self.server.as_mut() {
            Some(server) if self.flushed => server,
            _ => {
                let msg = self.client.read_message().await.map_err(Error::ClientRead)?;
                return Ok(Incoming::Client(msg));
            }
        };
        tokio::select! {
            msg = self.client.read_message() => {
                msg.map(Incoming::Client).map_err(Error::ClientRead)
            }
            msg = server.read_message() => {
                msg.map(Incoming::Server).map_err(Error::ServerRead)
            }
        }
    }

    async fn relay(&mut self) -> Result<(), Error> {
        loop {
            let msg = match self.next().await? {
                Incoming::Client(msg) => msg,
                Incoming::Server(msg) => {
                    self.reply(msg).await?;
                    self.client.flush().await.map_err(Error::ClientWrite)?;
                    continue;
                }
            };
            let tag = msg.tag();
            if tag == Tag::TERMINATE {
                return Ok(());
            }

            let pipelining = self.ctx.pipelining;
            let server = self.attach().await?;
            server.forward(&msg);
            if !tag.expects_ready() {
                if tag == Tag::FLUSH || server.pending_write() >= pipelining {
                    server.flush().await.map_err(Error::ServerWrite)?;
                }
                if tag == Tag::FLUSH {
                    self.flushed = true;
                }
                continue;
            }
            server.flush().await.map_err(Error::ServerWrite)?;
            self.flushed = false;
            self.relay_replies().await?;
        }
    }

    // Returns the attached server, attaching one first if needed.
    async fn attach(&mut self) -> Result<&mut Handle, Error> {
        if self.server.is_none() {
            let mut handle = self
                .ctx
                .router
                .attach(&self.ticket)
                .await
                .map_err(Error::Attach)?;
            if !handle.is_reattached() {
                if let Err(err) = backend::configure(&mut handle, &self.startup).await {
                    handle.close();
                    return Err(Error::ServerConfigure(err));
                }
            }
            self.server = Some(handle);
        }
        self.server
            .as_mut()
            .ok_or(Error::Attach(router::Error::NotRouted))
    }

    // Relays server replies until the server is synchronized.
    async fn relay_replies(&mut self) -> Result<(), Error> {
        loop {
            let Some(server) = self.server.as_mut() else {
                return Ok(());
            };
            let msg = read_server(server, &mut self.client).await?;
            if self.reply(msg).await? {
                return Ok(());
            }
        }
    }

    // Passes one server reply on to the client.
    //
    // Returns true once the server is synchronized.
    async fn reply(&mut self, msg: Message) -> Result<bool, Error> {
        let pipelining = self.ctx.pipelining;
        let Some(server) = self.server.as_mut() else {
            return Ok(true);
        };
        let status = server
            .observe(&msg)
            .map_err(|err| Error::ServerRead(err.into()))?;
        self.client.put(msg.as_bytes());

        match msg.tag() {
            Tag::READY_FOR_QUERY if server.is_synchronized() => {
                // The server goes back to the pool before the client hears
                // that its transaction is over.
                let released = if self.ticket.rule().pool == PoolingMode::Transaction
                    && status == Some(TransactionStatus::Idle)
                {
                    self.release().await
                } else {
                    Ok(())
                };
                self.client.flush().await.map_err(Error::ClientWrite)?;
                released.map(|()| true)
            }
            Tag::COPY_IN_RESPONSE => {
                self.client.flush().await.map_err(Error::ClientWrite)?;
                self.copy_in().await?;
                Ok(false)
            }
            _ => {
                if self.client.pending_write() >= pipelining {
                    self.client.flush().await.map_err(Error::ClientWrite)?;
                }
                Ok(false)
            }
        }
    }

    // Passes client data through to the server, until the client ends the
    // COPY.
    async fn copy_in(&mut self) -> Result<(), Error> {
        let pipelining = self.ctx.pipelining;
        loop {
            let msg = self.client.read_message().await.map_err(Error::ClientRead)?;
            let tag = msg.tag();
            let Some(server) = self.server.as_mut() else {
                return Ok(());
            };
            // The backend ignores these during a COPY.
            if tag == Tag::SYNC || tag == Tag::FLUSH {
                continue;
            }
            server.forward(&msg);
            if tag == Tag::COPY_DONE || tag == Tag::COPY_FAIL {
                server.flush().await.map_err(Error::ServerWrite)?;
                return Ok(());
            }
            if server.pending_write() >= pipelining {
                server.flush().await.map_err(Error::ServerWrite)?;
            }
        }
    }

    // Resets the attached server, and gives it back.
    async fn release(&mut self) -> Result<(), Error> {
        let Some(mut handle) = self.server.take() else {
            return Ok(());
        };
        let result = backend::reset(&mut handle, self.ticket.rule(), &self.ctx.dialer).await;
        #[cfg(feature = "probes")]
        probes::reset__done!(|| (
            handle.server_id().0,
            u8::from(matches!(result, Ok(Reset::Reusable)))
        ));
        match result {
            Ok(Reset::Reusable) => {
                handle.detach();
                Ok(())
            }
            Ok(Reset::Drop) => {
                handle.close();
                Ok(())
            }
            Err(err) => {
                handle.close();
                Err(Error::ServerReset(err))
            }
        }
    }

    async fn cleanup(mut self, result: Result<(), Error>) -> Result<(), Error> {
        match &result {
            // The client is done, or gone: the server may still be reusable.
            Ok(()) | Err(Error::ClientRead(_)) | Err(Error::ClientWrite(_)) => {
                if let Err(err) = self.release().await {
                    event!(Level::DEBUG, ?err, "Server closed during cleanup");
                }
            }
            Err(Error::Attach(_)) => {
                put_fatal(&mut self.client, "08006", "failed to connect to server");
                let _ = self.client.flush().await;
            }
            Err(_) => {
                put_fatal(&mut self.client, "08006", "server connection failed");
                let _ = self.client.flush().await;
                if let Some(handle) = self.server.take() {
                    handle.close();
                }
            }
        }
        // Dropping the ticket unroutes the client.
        drop(self.ticket);
        result
    }
}
