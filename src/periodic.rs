//! Housekeeping run by the router once per tick.

use crate::bucket::Visit;
#[cfg(feature = "probes")]
use crate::probes;
use crate::route::ServerState;
use crate::route_pool::RoutePool;
use crate::server::Detached;

use tracing::{event, Level};

/// Ages idle servers, collects the ones which should be closed, and frees
/// obsolete routes.
///
/// An idle server is expired once it has been idle for longer than its
/// route's `ttl`, as soon as its backend hangs up, or once its route is
/// obsolete and has no clients left.
///
/// Returns the connections which must be closed. They have already been
/// removed from their pools.
pub(crate) fn sweep(routes: &mut RoutePool) -> Vec<Detached> {
    let mut expired = vec![];
    for (_, route) in routes.iter_mut() {
        let ttl = route.rule.ttl;
        let retired = route.obsolete && route.clients.total() == 0;
        let route_id = &route.id;
        route.servers.foreach(ServerState::Idle, |_, entry| {
            let connected = entry.conn.as_mut().is_some_and(|conn| conn.is_connected());
            if !connected {
                event!(Level::DEBUG, route = %route_id, server = %entry.id, "Idle server disconnected");
                return Visit::Set(ServerState::Expire);
            }
            if retired {
                event!(Level::DEBUG, route = %route_id, server = %entry.id, "Closing server of obsolete route");
                return Visit::Set(ServerState::Expire);
            }
            if ttl == 0 {
                return Visit::Next;
            }
            if entry.idle_time < ttl {
                entry.idle_time += 1;
                return Visit::Next;
            }
            event!(
                Level::DEBUG,
                route = %route_id,
                server = %entry.id,
                idle_time = entry.idle_time,
                "Expiring idle server"
            );
            #[cfg(feature = "probes")]
            probes::expire!(|| (route_id.to_string(), entry.id.0, entry.idle_time));
            Visit::Set(ServerState::Expire)
        });

        for key in route.servers.keys(ServerState::Expire) {
            if let Some(entry) = route.servers.remove(key) {
                expired.extend(entry.conn.map(|conn| conn.0));
            }
        }
    }
    routes.gc();
    expired
}

/// Logs a summary of every route.
pub(crate) fn log_stats(routes: &RoutePool) {
    for (_, route) in routes.iter() {
        let stats = route.stats();
        event!(
            Level::INFO,
            route = %route.id,
            obsolete = route.obsolete,
            clients_pending = stats.clients_pending,
            clients_active = stats.clients_active,
            clients_queued = stats.clients_queued,
            servers_connecting = stats.servers_connecting,
            servers_idle = stats.servers_idle,
            servers_active = stats.servers_active,
            "Route stats"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::{Rule, Rules};
    use crate::route::ServerEntry;
    use crate::test_utils::detached_server;
    use debug_ignore::DebugIgnore;

    fn pool(ttl: u64) -> (RoutePool, crate::route_pool::RouteKey) {
        let rules = Rules::new(
            vec![],
            Some(Rule {
                ttl,
                ..Default::default()
            }),
        );
        let mut routes = RoutePool::new();
        let key = routes.match_or_create(&rules, "db", "svc").unwrap();
        (routes, key)
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (mut routes, route_key) = pool(5);
        let (conn, _peer) = detached_server();
        let mut entry = ServerEntry::new(conn.id());
        entry.conn = Some(DebugIgnore(conn));
        let server = routes
            .get_mut(route_key)
            .unwrap()
            .servers
            .insert(entry, ServerState::Idle);

        for tick in 1..=5 {
            assert!(sweep(&mut routes).is_empty(), "expired early, on tick {tick}");
            let servers = &routes.get(route_key).unwrap().servers;
            assert_eq!(servers.get(server).unwrap().idle_time, tick);
        }

        let expired = sweep(&mut routes);
        assert_eq!(expired.len(), 1);
        let route = routes.get(route_key).unwrap();
        assert_eq!(route.servers.total(), 0);
        route.servers.check_invariants();
    }

    #[tokio::test]
    async fn test_no_ttl_keeps_idle_servers() {
        let (mut routes, route_key) = pool(0);
        let (conn, _peer) = detached_server();
        let mut entry = ServerEntry::new(conn.id());
        entry.conn = Some(DebugIgnore(conn));
        let server = routes
            .get_mut(route_key)
            .unwrap()
            .servers
            .insert(entry, ServerState::Idle);

        for _ in 0..100 {
            assert!(sweep(&mut routes).is_empty());
        }
        let servers = &routes.get(route_key).unwrap().servers;
        assert_eq!(servers.get(server).unwrap().idle_time, 0);
    }

    #[tokio::test]
    async fn test_disconnected_server_expires() {
        let (mut routes, route_key) = pool(0);
        let (conn, peer) = detached_server();
        let mut entry = ServerEntry::new(conn.id());
        entry.conn = Some(DebugIgnore(conn));
        routes
            .get_mut(route_key)
            .unwrap()
            .servers
            .insert(entry, ServerState::Idle);

        drop(peer);
        assert_eq!(sweep(&mut routes).len(), 1);
    }

    #[tokio::test]
    async fn test_active_servers_do_not_age() {
        let (mut routes, route_key) = pool(1);
        let server = routes
            .get_mut(route_key)
            .unwrap()
            .servers
            .insert(ServerEntry::new(crate::ServerId::new()), ServerState::Active);

        for _ in 0..5 {
            assert!(sweep(&mut routes).is_empty());
        }
        let servers = &routes.get(route_key).unwrap().servers;
        assert_eq!(servers.state(server), Some(ServerState::Active));
    }

    #[tokio::test]
    async fn test_obsolete_routes_close_idle_servers() {
        let (mut routes, route_key) = pool(0);
        let (conn, _peer) = detached_server();
        let mut entry = ServerEntry::new(conn.id());
        entry.conn = Some(DebugIgnore(conn));
        routes
            .get_mut(route_key)
            .unwrap()
            .servers
            .insert(entry, ServerState::Idle);

        routes.reload(&Rules::default());
        assert_eq!(sweep(&mut routes).len(), 1);
        assert!(routes.get(route_key).is_none());
    }

    #[test]
    fn test_obsolete_empty_routes_are_collected() {
        let (mut routes, route_key) = pool(0);
        routes.reload(&Rules::default());
        sweep(&mut routes);
        assert!(routes.get(route_key).is_none());
    }
}
