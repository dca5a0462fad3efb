//! The router: the single owner of every route and pooled connection.
//!
//! All pool state lives inside one task. Client sessions send it requests
//! (route me, attach a server, cancel a query) and get replies through
//! oneshot channels. Servers come back through a separate unbounded channel,
//! which is fed by [claim::Handle] and [claim::Ticket] (including from their
//! `Drop` implementations), so cleanup happens on every exit path.

use crate::backend::{self, Backend, Dialer};
use crate::bucket::Key;
use crate::cancel;
use crate::claim;
use crate::config::Config;
use crate::periodic;
use crate::policy::Rules;
#[cfg(feature = "probes")]
use crate::probes;
use crate::protocol::CancelKey;
use crate::route::{ClientEntry, ClientState, RouteId, RouteStats, ServerEntry, ServerState};
use crate::route_pool::{MatchError, RouteKey, RoutePool};
use crate::server::{Detached, ServerConnection};
use crate::{ClientId, ServerId};

use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant};
use tracing::{event, instrument, Level};

// How many requests may wait for the router before senders block.
const REQUEST_QUEUE_DEPTH: usize = 128;

// How often the sweeper runs.
pub(crate) const TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum Error {
    #[error("No route matches this database and user")]
    RouteNotFound,

    #[error("Too many clients")]
    LimitReached,

    #[error("Timed out waiting for a server")]
    PoolTimeout,

    #[error("Failed to connect to server")]
    Connect(#[from] backend::Error),

    #[error("Client is not routed")]
    NotRouted,

    #[error("Router terminated")]
    Terminated,
}

impl Error {
    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    const fn as_str(&self) -> &'static str {
        match self {
            Error::RouteNotFound => "RouteNotFound",
            Error::LimitReached => "LimitReached",
            Error::PoolTimeout => "PoolTimeout",
            Error::Connect(_) => "Connect",
            Error::NotRouted => "NotRouted",
            Error::Terminated => "Terminated",
        }
    }
}

type AttachReply = oneshot::Sender<Result<claim::Handle, Error>>;

enum Request {
    Route {
        id: ClientId,
        key: CancelKey,
        database: String,
        user: String,
        tx: oneshot::Sender<Result<claim::Ticket, Error>>,
    },
    Attach {
        route: RouteKey,
        client: Key,
        tx: AttachReply,
    },
    Cancel {
        key: CancelKey,
    },
    Reload {
        rules: Rules,
        tx: oneshot::Sender<()>,
    },
    Stats {
        tx: oneshot::Sender<Vec<(RouteId, RouteStats)>>,
    },
    Terminate,
}

/// Connections and clients handed back to the router.
#[derive(Debug)]
pub(crate) enum Return {
    /// The server may be reused.
    Detach {
        route: RouteKey,
        client: Key,
        server: Key,
        conn: Detached,
    },
    /// The server must be closed.
    Close {
        route: RouteKey,
        client: Key,
        server: Key,
        conn: Detached,
    },
    /// The client is gone.
    Unroute { route: RouteKey, client: Key },
}

// A client waiting for a server to be returned to a full route.
struct Waiter {
    route: RouteKey,
    client: Key,
    tx: AttachReply,
    deadline: Instant,
}

// The outcome of connecting a server on behalf of a client.
struct Connected {
    route: RouteKey,
    server: Key,
    client: Key,
    tx: AttachReply,
    result: Result<ServerConnection, backend::Error>,
}

pub(crate) struct RouterInner {
    rules: Rules,
    pub(crate) routes: RoutePool,
    client_max: usize,
    stats_interval: u64,
    dialer: Dialer,

    rx: mpsc::Receiver<Request>,
    returns_tx: mpsc::UnboundedSender<Return>,
    returns_rx: mpsc::UnboundedReceiver<Return>,

    // Servers being connected, polled by the router task itself.
    attachers: FuturesUnordered<BoxFuture<'static, Connected>>,
    waiters: VecDeque<Waiter>,
    ticks: u64,
}

impl RouterInner {
    fn new(config: &Config, dialer: Dialer, rx: mpsc::Receiver<Request>) -> Self {
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        Self {
            rules: config.rules(),
            routes: RoutePool::new(),
            client_max: config.client_max,
            stats_interval: config.stats_interval,
            dialer,
            rx,
            returns_tx,
            returns_rx,
            attachers: FuturesUnordered::new(),
            waiters: VecDeque::new(),
            ticks: 0,
        }
    }

    async fn run(mut self) {
        let mut tick = interval(TICK);
        tick.reset();

        loop {
            // Either get the next waiter timeout, or wait forever.
            let next_deadline = self.waiters.iter().map(|w| w.deadline).min();
            let next_waiter_timeout = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                // Returned servers are handled first, so a client which
                // detaches and attaches again finds its old server idle.
                biased;

                Some(ret) = self.returns_rx.recv() => self.handle_return(ret),
                request = self.rx.recv() => {
                    // A return may have been sent right before this request
                    // by the same client.
                    self.drain_returns();
                    match request {
                        Some(Request::Route { id, key, database, user, tx }) => {
                            let result = self.route(id, key, &database, &user);
                            if let Err(Ok(ticket)) = tx.send(result) {
                                // The client left; dropping the ticket
                                // unroutes it.
                                drop(ticket);
                            }
                        }
                        Some(Request::Attach { route, client, tx }) => {
                            self.attach(route, client, tx);
                        }
                        Some(Request::Cancel { key }) => self.cancel(key),
                        Some(Request::Reload { rules, tx }) => {
                            self.reload(rules);
                            let _ = tx.send(());
                        }
                        Some(Request::Stats { tx }) => {
                            let _ = tx.send(self.stats());
                        }
                        // The caller has explicitly asked us to terminate.
                        Some(Request::Terminate) => {
                            self.terminate().await;
                            return;
                        }
                        // The caller has abandoned the router.
                        None => {
                            self.terminate().await;
                            return;
                        }
                    }
                }
                Some(connected) = self.attachers.next(), if !self.attachers.is_empty() => {
                    self.on_connected(connected);
                }
                _ = next_waiter_timeout => self.expire_waiters(),
                _ = tick.tick() => {
                    self.ticks += 1;
                    self.sweep();
                }
            }
        }
    }

    fn drain_returns(&mut self) {
        while let Ok(ret) = self.returns_rx.try_recv() {
            self.handle_return(ret);
        }
    }

    #[instrument(skip(self, key), name = "RouterInner::route")]
    fn route(
        &mut self,
        id: ClientId,
        key: CancelKey,
        database: &str,
        user: &str,
    ) -> Result<claim::Ticket, Error> {
        let result = self.route_inner(id, key, database, user);
        match &result {
            Ok(ticket) => {
                event!(Level::DEBUG, route = %ticket.route_id(), "Client routed");
                #[cfg(feature = "probes")]
                probes::route__done!(|| (ticket.route_id().to_string(), id.0));
            }
            Err(err) => {
                event!(Level::INFO, ?err, "Failed to route client");
                #[cfg(feature = "probes")]
                probes::route__failed!(|| (id.0, err.as_str()));
            }
        }
        result
    }

    fn route_inner(
        &mut self,
        id: ClientId,
        key: CancelKey,
        database: &str,
        user: &str,
    ) -> Result<claim::Ticket, Error> {
        if self.client_max > 0 && self.routes.clients_total() >= self.client_max {
            return Err(Error::LimitReached);
        }
        let route_key = self
            .routes
            .match_or_create(&self.rules, database, user)
            .map_err(|MatchError::NotFound| Error::RouteNotFound)?;
        let Some(route) = self.routes.get_mut(route_key) else {
            return Err(Error::RouteNotFound);
        };
        if route.rule.client_max > 0 && route.clients.total() >= route.rule.client_max {
            return Err(Error::LimitReached);
        }
        let client = route.clients.insert(
            ClientEntry {
                id,
                key,
                server: None,
            },
            ClientState::Pending,
        );
        Ok(claim::Ticket::new(
            route_key,
            client,
            id,
            route.id.clone(),
            route.rule.clone(),
            self.returns_tx.clone(),
        ))
    }

    // Finds a server for a client: an idle one if possible, a new one if
    // the route has room, or the next one returned otherwise.
    fn attach(&mut self, route_key: RouteKey, client_key: Key, tx: AttachReply) {
        let Some(route) = self.routes.get_mut(route_key) else {
            let _ = tx.send(Err(Error::NotRouted));
            return;
        };
        if route.clients.state(client_key) != Some(ClientState::Pending) {
            let _ = tx.send(Err(Error::NotRouted));
            return;
        }
        #[cfg(feature = "probes")]
        if let Some(client) = route.clients.get(client_key) {
            probes::attach__start!(|| (route.id.to_string(), client.id.0));
        }

        while let Some(server_key) = route.servers.next(ServerState::Idle) {
            let conn = route
                .servers
                .get_mut(server_key)
                .and_then(|entry| entry.conn.take());
            let Some(DebugIgnore(mut conn)) = conn else {
                route.servers.remove(server_key);
                continue;
            };
            if !conn.is_connected() {
                event!(Level::DEBUG, server = %conn.id(), "Idle server disconnected");
                route.servers.remove(server_key);
                tokio::task::spawn(conn.close());
                continue;
            }
            self.hand_over(route_key, client_key, server_key, conn.attach(), tx);
            return;
        }

        if route.has_capacity() {
            self.start_connect(route_key, client_key, tx);
            return;
        }

        let timeout = route.rule.pool_timeout();
        if timeout.is_zero() {
            self.fail_attach(route_key, client_key, tx, Error::PoolTimeout);
            return;
        }
        route.clients.set(client_key, ClientState::Queued);
        self.waiters.push_back(Waiter {
            route: route_key,
            client: client_key,
            tx,
            deadline: Instant::now() + timeout,
        });
    }

    fn fail_attach(&mut self, route_key: RouteKey, client_key: Key, tx: AttachReply, err: Error) {
        if let Some(route) = self.routes.get_mut(route_key) {
            route.clients.set(client_key, ClientState::Pending);
            #[cfg(feature = "probes")]
            if let Some(client) = route.clients.get(client_key) {
                probes::attach__failed!(|| (route.id.to_string(), client.id.0, err.as_str()));
            }
        }
        event!(Level::INFO, ?err, "Failed to attach server");
        let _ = tx.send(Err(err));
    }

    // Gives an attached connection to a client.
    fn hand_over(
        &mut self,
        route_key: RouteKey,
        client_key: Key,
        server_key: Key,
        conn: ServerConnection,
        tx: AttachReply,
    ) {
        let Some(route) = self.routes.get_mut(route_key) else {
            tokio::task::spawn(conn.close());
            return;
        };
        let Some(client) = route.clients.get_mut(client_key) else {
            // The client left while waiting; keep the server.
            self.park(route_key, server_key, conn.detach());
            return;
        };
        client.server = Some(server_key);
        let (client_id, client_cancel_key) = (client.id, client.key);
        route.clients.set(client_key, ClientState::Active);

        let reattached = match route.servers.get_mut(server_key) {
            Some(entry) => {
                let reattached = entry.last_client == Some(client_id);
                entry.last_client = Some(client_id);
                entry.key_client = Some(client_cancel_key);
                reattached
            }
            None => false,
        };
        route.servers.set(server_key, ServerState::Active);

        #[cfg(feature = "probes")]
        probes::attach__done!(|| (route.id.to_string(), client_id.0, conn.id().0));
        event!(
            Level::DEBUG,
            client = %client_id,
            server = %conn.id(),
            reattached,
            "Attached server"
        );

        let handle = claim::Handle::new(
            conn,
            route_key,
            client_key,
            server_key,
            reattached,
            self.returns_tx.clone(),
        );
        if let Err(Ok(handle)) = tx.send(Ok(handle)) {
            // Nobody is waiting for this server anymore.
            let conn = handle.release();
            if let Some(route) = self.routes.get_mut(route_key) {
                if let Some(client) = route.clients.get_mut(client_key) {
                    client.server = None;
                }
                route.clients.set(client_key, ClientState::Pending);
            }
            self.park(route_key, server_key, conn.detach());
        }
    }

    // Puts a server in the idle pool of its route, and hands it to the
    // next waiter, if any.
    fn park(&mut self, route_key: RouteKey, server_key: Key, conn: Detached) {
        let Some(route) = self.routes.get_mut(route_key) else {
            tokio::task::spawn(conn.close());
            return;
        };
        let Some(entry) = route.servers.get_mut(server_key) else {
            tokio::task::spawn(conn.close());
            return;
        };
        entry.conn = Some(DebugIgnore(conn));
        entry.key_client = None;
        route.servers.set(server_key, ServerState::Idle);
        self.wake(route_key);
    }

    fn start_connect(&mut self, route_key: RouteKey, client_key: Key, tx: AttachReply) {
        let Some(route) = self.routes.get_mut(route_key) else {
            let _ = tx.send(Err(Error::NotRouted));
            return;
        };
        let id = ServerId::new();
        let server_key = route
            .servers
            .insert(ServerEntry::new(id), ServerState::Connect);
        route.clients.set(client_key, ClientState::Queued);

        let dialer = self.dialer.clone();
        let route_id = route.id.clone();
        let rule = route.rule.clone();
        event!(Level::DEBUG, route = %route_id, server = %id, "Connecting server");
        #[cfg(feature = "probes")]
        probes::connect__start!(|| (
            route_id.to_string(),
            id.0,
            Backend::from(&rule.storage).to_string()
        ));

        self.attachers.push(Box::pin(async move {
            let result = dialer.connect(id, &route_id, &rule).await;
            #[cfg(feature = "probes")]
            match &result {
                Ok(_) => probes::connect__done!(|| (route_id.to_string(), id.0)),
                Err(err) => {
                    probes::connect__failed!(|| (route_id.to_string(), id.0, err.as_str()))
                }
            }
            Connected {
                route: route_key,
                server: server_key,
                client: client_key,
                tx,
                result,
            }
        }));
    }

    fn on_connected(&mut self, connected: Connected) {
        let Connected {
            route: route_key,
            server: server_key,
            client: client_key,
            tx,
            result,
        } = connected;

        let conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                event!(Level::WARN, ?err, "Failed to connect server");
                if let Some(route) = self.routes.get_mut(route_key) {
                    route.servers.remove(server_key);
                }
                self.fail_attach(route_key, client_key, tx, Error::Connect(err));
                self.wake(route_key);
                self.routes.gc_one(route_key);
                return;
            }
        };

        let Some(route) = self.routes.get_mut(route_key) else {
            tokio::task::spawn(conn.close());
            return;
        };
        let Some(entry) = route.servers.get_mut(server_key) else {
            tokio::task::spawn(conn.close());
            return;
        };
        entry.key = conn.key();

        let waiting = route.clients.state(client_key) == Some(ClientState::Queued)
            && !tx.is_closed();
        if waiting {
            self.hand_over(route_key, client_key, server_key, conn, tx);
        } else {
            // The requester left; keep the server for somebody else.
            route.clients.set(client_key, ClientState::Pending);
            self.park(route_key, server_key, conn.detach());
        }
    }

    // Hands servers to clients waiting on a route, for as long as the route
    // has servers to give.
    fn wake(&mut self, route_key: RouteKey) {
        loop {
            let Some(route) = self.routes.get(route_key) else {
                return;
            };
            if route.servers.count(ServerState::Idle) == 0 && !route.has_capacity() {
                return;
            }
            let Some(position) = self.waiters.iter().position(|w| w.route == route_key) else {
                return;
            };
            let Some(waiter) = self.waiters.remove(position) else {
                return;
            };
            if let Some(route) = self.routes.get_mut(route_key) {
                route.clients.set(waiter.client, ClientState::Pending);
            }
            if waiter.tx.is_closed() {
                continue;
            }
            self.attach(route_key, waiter.client, waiter.tx);
        }
    }

    // Fails every waiter whose deadline has passed.
    fn expire_waiters(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].deadline > now {
                i += 1;
                continue;
            }
            let Some(waiter) = self.waiters.remove(i) else {
                break;
            };
            self.fail_attach(waiter.route, waiter.client, waiter.tx, Error::PoolTimeout);
        }
    }

    fn handle_return(&mut self, ret: Return) {
        match ret {
            Return::Detach {
                route,
                client,
                server,
                conn,
            } => self.detach(route, client, server, conn),
            Return::Close {
                route,
                client,
                server,
                conn,
            } => self.close(route, client, server, conn),
            Return::Unroute { route, client } => self.unroute(route, client),
        }
    }

    // Marks the client as no longer using a server.
    fn release_client(&mut self, route_key: RouteKey, client_key: Key) {
        if let Some(route) = self.routes.get_mut(route_key) {
            if let Some(client) = route.clients.get_mut(client_key) {
                client.server = None;
            }
            route.clients.set(client_key, ClientState::Pending);
        }
    }

    fn detach(&mut self, route_key: RouteKey, client_key: Key, server_key: Key, conn: Detached) {
        #[cfg(feature = "probes")]
        if let Some(route) = self.routes.get(route_key) {
            let client_id = route.clients.get(client_key).map(|c| c.id.0).unwrap_or(0);
            probes::detach!(|| (route.id.to_string(), client_id, conn.id().0));
        }
        event!(Level::DEBUG, server = %conn.id(), "Detached server");
        self.release_client(route_key, client_key);
        self.park(route_key, server_key, conn);
    }

    fn close(&mut self, route_key: RouteKey, client_key: Key, server_key: Key, conn: Detached) {
        event!(Level::DEBUG, server = %conn.id(), "Closing server");
        self.release_client(route_key, client_key);
        if let Some(route) = self.routes.get_mut(route_key) {
            route.servers.remove(server_key);
        }
        tokio::task::spawn(conn.close());
        self.wake(route_key);
        self.routes.gc_one(route_key);
    }

    fn unroute(&mut self, route_key: RouteKey, client_key: Key) {
        if let Some(route) = self.routes.get_mut(route_key) {
            route.clients.remove(client_key);
        }
        self.waiters
            .retain(|w| !(w.route == route_key && w.client == client_key));
        self.routes.gc_one(route_key);
    }

    // Finds the server running a query for the client holding "key", and
    // asks its backend to cancel it.
    #[instrument(skip(self), name = "RouterInner::cancel")]
    fn cancel(&mut self, key: CancelKey) {
        let Some((route_key, server_key)) = self
            .routes
            .find_server(ServerState::Active, |entry| entry.key_client == Some(key))
        else {
            event!(Level::DEBUG, "No server matches cancel request");
            return;
        };
        let Some(route) = self.routes.get(route_key) else {
            return;
        };
        let Some(entry) = route.servers.get(server_key) else {
            return;
        };
        event!(Level::DEBUG, route = %route.id, server = %entry.id, "Cancelling query");
        cancel::spawn_cancel(
            self.dialer.clone(),
            Backend::from(&route.rule.storage),
            entry.key,
        );
    }

    #[instrument(skip_all, name = "RouterInner::reload")]
    fn reload(&mut self, rules: Rules) {
        self.routes.reload(&rules);
        self.rules = rules;
        self.routes.gc();
    }

    fn stats(&self) -> Vec<(RouteId, RouteStats)> {
        self.routes
            .iter()
            .map(|(_, route)| (route.id.clone(), route.stats()))
            .collect()
    }

    fn sweep(&mut self) {
        for conn in periodic::sweep(&mut self.routes) {
            tokio::task::spawn(conn.close());
        }
        if self.stats_interval > 0 && self.ticks % self.stats_interval == 0 {
            periodic::log_stats(&self.routes);
        }
    }

    // Closes every idle server, and fails every waiting client.
    #[instrument(skip(self), name = "RouterInner::terminate")]
    async fn terminate(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(Error::Terminated));
        }
        self.attachers.clear();

        let mut idle = vec![];
        for (_, route) in self.routes.iter_mut() {
            for key in route.servers.keys(ServerState::Idle) {
                if let Some(DebugIgnore(conn)) =
                    route.servers.get_mut(key).and_then(|entry| entry.conn.take())
                {
                    idle.push(conn);
                }
                route.servers.remove(key);
            }
        }
        futures::future::join_all(idle.into_iter().map(|conn| conn.close())).await;
    }
}

/// A handle to the router task.
///
/// Cheap to clone; every clone talks to the same router.
#[derive(Clone)]
pub struct Router {
    tx: mpsc::Sender<Request>,
}

impl Router {
    /// Spawns the router task.
    pub(crate) fn spawn(config: &Config, dialer: Dialer) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let inner = RouterInner::new(config, dialer, rx);
        let handle = tokio::task::spawn(inner.run());
        (Self { tx }, handle)
    }

    /// Assigns a client to the route for `database` and `user`.
    #[instrument(level = "debug", skip(self, key), err, name = "Router::route")]
    pub async fn route(
        &self,
        id: ClientId,
        key: CancelKey,
        database: &str,
        user: &str,
    ) -> Result<claim::Ticket, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Route {
                id,
                key,
                database: database.to_string(),
                user: user.to_string(),
                tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Acquires a server for a routed client.
    ///
    /// This may wait for a new server to be connected, or, if the route is
    /// at its `pool_size`, for another client to return a server.
    #[instrument(level = "debug", skip_all, fields(client = %ticket.client_id()), err, name = "Router::attach")]
    pub async fn attach(&self, ticket: &claim::Ticket) -> Result<claim::Handle, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Attach {
                route: ticket.route,
                client: ticket.client,
                tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Cancels the query running for the client which was issued `key`.
    ///
    /// Does nothing if no such client is running a query.
    pub async fn cancel(&self, key: CancelKey) -> Result<(), Error> {
        self.tx
            .send(Request::Cancel { key })
            .await
            .map_err(|_| Error::Terminated)
    }

    /// Installs a new set of rules.
    pub async fn reload(&self, rules: Rules) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Reload { rules, tx })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Samples the state of every route.
    pub async fn stats(&self) -> Result<Vec<(RouteId, RouteStats)>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Stats { tx })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    pub(crate) async fn terminate(&self) -> Result<(), Error> {
        self.tx
            .send(Request::Terminate)
            .await
            .map_err(|_| Error::Terminated)
    }
}
