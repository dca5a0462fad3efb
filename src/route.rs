//! Routes: the unit of pooling.
//!
//! Every client is assigned to a route, identified by the database and user
//! it will be connected as. Each route owns the servers connected on behalf
//! of its clients.

use crate::bucket::{self, Buckets, Key, Transition};
use crate::policy::Rule;
use crate::protocol::CancelKey;
use crate::server::Detached;
use crate::{ClientId, ServerId};

use bytes::Bytes;
use debug_ignore::DebugIgnore;
use std::sync::Arc;

/// Identifies a route by the (database, user) pair its servers use.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId {
    pub database: Bytes,
    pub user: Bytes,
}

impl RouteId {
    pub fn new(database: impl Into<Bytes>, user: impl Into<Bytes>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
        }
    }

    pub(crate) fn database_lossy(&self) -> String {
        String::from_utf8_lossy(&self.database).into_owned()
    }

    pub(crate) fn user_lossy(&self) -> String {
        String::from_utf8_lossy(&self.user).into_owned()
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database_lossy(), self.user_lossy())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ServerState {
    /// Being connected by the router.
    Connect,
    /// Parked, waiting for a client.
    Idle,
    /// Attached to a client.
    Active,
    /// Waiting to be closed.
    Expire,
}

impl bucket::State for ServerState {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        self as usize
    }
}

/// The router's record of one server.
#[derive(Debug)]
pub(crate) struct ServerEntry {
    pub(crate) id: ServerId,
    /// The key issued by the backend, for cancellation.
    pub(crate) key: CancelKey,
    /// The cancel key of the client using this server, if any.
    pub(crate) key_client: Option<CancelKey>,
    /// Seconds this server has been idle, counted by the sweeper.
    pub(crate) idle_time: u64,
    pub(crate) last_client: Option<ClientId>,
    /// Present only while the server is Idle or Expire.
    pub(crate) conn: Option<DebugIgnore<Detached>>,
}

impl ServerEntry {
    pub(crate) fn new(id: ServerId) -> Self {
        Self {
            id,
            key: CancelKey::default(),
            key_client: None,
            idle_time: 0,
            last_client: None,
            conn: None,
        }
    }
}

impl Transition<ServerState> for ServerEntry {
    fn on_transition(&mut self, from: ServerState, _to: ServerState) {
        if from == ServerState::Idle {
            self.idle_time = 0;
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ClientState {
    /// Routed, with no server.
    Pending,
    /// Using a server.
    Active,
    /// Waiting for a server to be connected or freed.
    Queued,
}

impl bucket::State for ClientState {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        self as usize
    }
}

/// The router's record of one client.
#[derive(Debug)]
pub(crate) struct ClientEntry {
    pub(crate) id: ClientId,
    pub(crate) key: CancelKey,
    pub(crate) server: Option<Key>,
}

impl Transition<ClientState> for ClientEntry {}

pub(crate) type ServerPool = Buckets<ServerState, ServerEntry>;
pub(crate) type ClientPool = Buckets<ClientState, ClientEntry>;

/// A point-in-time summary of one route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub clients_pending: usize,
    pub clients_active: usize,
    pub clients_queued: usize,
    pub servers_connecting: usize,
    pub servers_idle: usize,
    pub servers_active: usize,
    pub servers_expiring: usize,
}

impl RouteStats {
    pub fn clients(&self) -> usize {
        self.clients_pending + self.clients_active + self.clients_queued
    }

    pub fn servers(&self) -> usize {
        self.servers_connecting + self.servers_idle + self.servers_active + self.servers_expiring
    }
}

pub(crate) struct Route {
    pub(crate) id: RouteId,
    pub(crate) rule: Arc<Rule>,
    /// Set once the rule this route follows is no longer configured.
    pub(crate) obsolete: bool,
    pub(crate) servers: ServerPool,
    pub(crate) clients: ClientPool,
}

impl Route {
    pub(crate) fn new(id: RouteId, rule: Arc<Rule>) -> Self {
        Self {
            id,
            rule,
            obsolete: false,
            servers: ServerPool::new(),
            clients: ClientPool::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.servers.total() == 0 && self.clients.total() == 0
    }

    /// Returns true if the route may connect another server.
    pub(crate) fn has_capacity(&self) -> bool {
        self.rule.pool_size == 0 || self.servers.total() < self.rule.pool_size
    }

    pub(crate) fn stats(&self) -> RouteStats {
        RouteStats {
            clients_pending: self.clients.count(ClientState::Pending),
            clients_active: self.clients.count(ClientState::Active),
            clients_queued: self.clients.count(ClientState::Queued),
            servers_connecting: self.servers.count(ServerState::Connect),
            servers_idle: self.servers.count(ServerState::Idle),
            servers_active: self.servers.count(ServerState::Active),
            servers_expiring: self.servers.count(ServerState::Expire),
        }
    }
}
