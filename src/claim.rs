//! Tokens held by a client session: a [Ticket] for its route, and a
//! [Handle] for the server attached to it.

use crate::bucket::Key;
use crate::policy::Rule;
use crate::route::RouteId;
use crate::route_pool::RouteKey;
use crate::router::Return;
use crate::server::ServerConnection;
use crate::{ClientId, ServerId};

use std::sync::Arc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::UnboundedSender;

/// Proof that a client has been assigned to a route.
///
/// The client stays routed (and counts towards the `client_max` limits)
/// until the ticket is dropped.
pub struct Ticket {
    pub(crate) route: RouteKey,
    pub(crate) client: Key,
    id: ClientId,
    route_id: RouteId,
    rule: Arc<Rule>,
    returns: UnboundedSender<Return>,
}

impl Ticket {
    pub(crate) fn new(
        route: RouteKey,
        client: Key,
        id: ClientId,
        route_id: RouteId,
        rule: Arc<Rule>,
        returns: UnboundedSender<Return>,
    ) -> Self {
        Self {
            route,
            client,
            id,
            route_id,
            rule,
            returns,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    pub fn route_id(&self) -> &RouteId {
        &self.route_id
    }

    /// The rule governing this client's route.
    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("client", &self.id)
            .field("route", &self.route_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let _ = self.returns.send(Return::Unroute {
            route: self.route,
            client: self.client,
        });
    }
}

/// A [ServerConnection] attached to a client.
///
/// Implements [std::ops::Deref] for the connection, so the handle can be
/// used wherever a connection is expected.
///
/// A handle should be given back with [Handle::detach] (if the connection
/// may be reused) or [Handle::close]. A handle which is simply dropped
/// closes its connection.
pub struct Handle {
    conn: Option<ServerConnection>,
    route: RouteKey,
    client: Key,
    server: Key,
    reattached: bool,
    returns: UnboundedSender<Return>,
}

impl Handle {
    pub(crate) fn new(
        conn: ServerConnection,
        route: RouteKey,
        client: Key,
        server: Key,
        reattached: bool,
        returns: UnboundedSender<Return>,
    ) -> Self {
        Self {
            conn: Some(conn),
            route,
            client,
            server,
            reattached,
            returns,
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.id()
    }

    /// Returns true if the last client to use this server was the one now
    /// holding it.
    pub fn is_reattached(&self) -> bool {
        self.reattached
    }

    /// Returns the connection to the idle pool of its route.
    pub fn detach(mut self) {
        if let Some(conn) = self.conn.take() {
            self.give_back(Return::Detach {
                route: self.route,
                client: self.client,
                server: self.server,
                conn: conn.detach(),
            });
        }
    }

    /// Removes the connection from its pool, and closes it.
    pub fn close(mut self) {
        self.send_close();
    }

    // Takes the connection back without notifying the router, which is
    // expected to put it somewhere itself.
    pub(crate) fn release(mut self) -> ServerConnection {
        self.conn
            .take()
            .expect("Handle always holds a connection until consumed")
    }

    fn send_close(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.give_back(Return::Close {
                route: self.route,
                client: self.client,
                server: self.server,
                conn: conn.detach(),
            });
        }
    }

    // Once the router has terminated, nobody is left to close the
    // connection but us.
    fn give_back(&self, ret: Return) {
        let Err(SendError(ret)) = self.returns.send(ret) else {
            return;
        };
        if let Return::Detach { conn, .. } | Return::Close { conn, .. } = ret {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(conn.close());
            }
        }
    }
}

impl std::ops::Deref for Handle {
    type Target = ServerConnection;
    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("Handle always holds a connection until consumed")
    }
}

impl std::ops::DerefMut for Handle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("Handle always holds a connection until consumed")
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("conn", &self.conn)
            .field("reattached", &self.reattached)
            .finish_non_exhaustive()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.send_close();
    }
}
