//! pgorb is a PostgreSQL connection pooler and request router.
//!
//! pgorb terminates many client connections and multiplexes them onto a
//! smaller set of backend connections.
//!
//! It uses the following terminology:
//! * A route is identified by a (database, user) pair. Each route owns a pool
//!   of server connections and a pool of client connections, and follows a
//!   single [policy::Rule].
//! * A server is a connection from the pooler to a PostgreSQL backend.
//! * A client is a connection accepted by the pooler.
//!
//! # Usage
//!
//! * The main interface for this crate is [pooler::Pooler].
//! * To construct a pooler, you must supply a [config::Config], a
//!   [backend::Connector] and an [auth::Authenticator]. These describe "which
//!   routes exist", "how to reach backends", and "how clients and servers
//!   authenticate", respectively.
//!
//! All pool state is owned by a single router task. Client sessions talk to
//! it through a message queue; a backend connection is moved into the client
//! session that attaches it, and moved back when it is detached.
//!
//! # DTrace probes
//!
//! pgorb contains a number of DTrace USDT probes, which fire as the router
//! hands out and takes back server connections. The full list of probes is:
//!
//! - `route-done`: Fires when a client has been assigned a route.
//! - `route-failed`: Fires when a client could not be routed.
//! - `attach-start`: Fires when the router begins to attach a server.
//! - `attach-done`: Fires when a server is handed to a client.
//! - `attach-failed`: Fires when a client could not get a server.
//! - `detach`: Fires when a server returns to the idle pool.
//! - `connect-start`: Fires before connecting to a backend.
//! - `connect-done`: Fires after a backend connection finished its setup.
//! - `connect-failed`: Fires after failing to set up a backend connection.
//! - `reset-done`: Fires after resetting a server returned by a client.
//! - `expire`: Fires when the sweeper expires an idle server.
//! - `cancel`: Fires when a cancel request is sent to a backend.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default.

// Public API
pub mod auth;
pub mod backend;
pub mod claim;
pub mod config;
pub mod policy;
pub mod pooler;
pub mod protocol;
pub mod router;
pub mod server;
pub mod stream;
pub mod tls;

// Necessary for implementation
mod bucket;
mod cancel;
mod frontend;
mod join;
mod periodic;
mod route;
mod route_pool;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;

pub use route::{RouteId, RouteStats};

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Uniquely identifies a client connection
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl ClientId {
    pub(crate) fn new() -> Self {
        Self(next_id())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Uniquely identifies a server connection
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerId(pub u64);

impl ServerId {
    pub(crate) fn new() -> Self {
        Self(next_id())
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// USDT probes for tracing how pgorb routes clients and hands out servers.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "pgorb")]
mod probes {
    /// Fires when a client has been assigned to a route.
    fn route__done(route: &str, client_id: u64) {}

    /// Fires when a client could not be routed, with a string identifying
    /// the reason.
    fn route__failed(client_id: u64, reason: &str) {}

    /// Fires when the router starts looking for a server for a client.
    fn attach__start(route: &str, client_id: u64) {}

    /// Fires when a server has been handed to a client.
    fn attach__done(route: &str, client_id: u64, server_id: u64) {}

    /// Fires when a client could not get a server, with a string
    /// identifying the reason.
    fn attach__failed(route: &str, client_id: u64, reason: &str) {}

    /// Fires when a server returns to the idle pool of its route.
    fn detach(route: &str, client_id: u64, server_id: u64) {}

    /// Fires right before attempting to connect to a backend, with the
    /// address we're connecting to.
    fn connect__start(route: &str, server_id: u64, addr: &str) {}

    /// Fires once a new backend connection has completed its setup.
    fn connect__done(route: &str, server_id: u64) {}

    /// Fires after failing to connect to, or set up, a backend.
    fn connect__failed(route: &str, server_id: u64, reason: &str) {}

    /// Fires after a server returned by a client has been reset, with a
    /// boolean indicating if the server may be reused.
    fn reset__done(server_id: u64, reusable: u8) {}

    /// Fires when the sweeper expires an idle server.
    fn expire(route: &str, server_id: u64, idle_time: u64) {}

    /// Fires when a cancel request is sent to a backend.
    fn cancel(addr: &str, pid: u64) {}
}
