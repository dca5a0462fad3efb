//! The collection of every route known to the router.

use crate::bucket::Key;
use crate::policy::Rules;
use crate::route::{Route, RouteId, ServerEntry, ServerState};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{event, Level};

/// Refers to a route within a [RoutePool].
///
/// Keys are handed out in increasing order and never reused, so iterating
/// over routes visits them in creation order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RouteKey(u64);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MatchError {
    /// No rule covers the requested database and user.
    NotFound,
}

pub(crate) struct RoutePool {
    routes: BTreeMap<RouteKey, Route>,
    next_key: u64,
}

impl RoutePool {
    pub(crate) fn new() -> Self {
        Self {
            routes: BTreeMap::new(),
            next_key: 0,
        }
    }

    /// Finds the route for a client asking for `database` as `user`,
    /// creating it if needed.
    ///
    /// The rule may substitute the database or user the route connects as.
    /// Clients which end up at the same target share one route, as long as
    /// they were matched by the same rule.
    pub(crate) fn match_or_create(
        &mut self,
        rules: &Rules,
        database: &str,
        user: &str,
    ) -> Result<RouteKey, MatchError> {
        let rule = rules.matching(database, user).ok_or(MatchError::NotFound)?;
        let id = RouteId::new(
            rule.storage_db.as_deref().unwrap_or(database).to_string(),
            rule.storage_user.as_deref().unwrap_or(user).to_string(),
        );

        if let Some((key, _)) = self
            .routes
            .iter()
            .find(|(_, route)| {
                !route.obsolete && route.id == id && Arc::ptr_eq(&route.rule, rule)
            })
        {
            return Ok(*key);
        }

        let key = RouteKey(self.next_key);
        self.next_key += 1;
        event!(Level::INFO, route = %id, "Creating route");
        self.routes.insert(key, Route::new(id, rule.clone()));
        Ok(key)
    }

    pub(crate) fn get(&self, key: RouteKey) -> Option<&Route> {
        self.routes.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: RouteKey) -> Option<&mut Route> {
        self.routes.get_mut(&key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (RouteKey, &Route)> {
        self.routes.iter().map(|(key, route)| (*key, route))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (RouteKey, &mut Route)> {
        self.routes.iter_mut().map(|(key, route)| (*key, route))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }

    /// The number of clients routed across all routes.
    pub(crate) fn clients_total(&self) -> usize {
        self.routes.values().map(|route| route.clients.total()).sum()
    }

    /// Frees every obsolete route with no clients and no servers.
    pub(crate) fn gc(&mut self) {
        self.routes.retain(|_, route| {
            let keep = !(route.obsolete && route.is_empty());
            if !keep {
                event!(Level::INFO, route = %route.id, "Removing obsolete route");
            }
            keep
        });
    }

    /// Frees one route, if it is obsolete and empty.
    pub(crate) fn gc_one(&mut self, key: RouteKey) {
        if self
            .routes
            .get(&key)
            .is_some_and(|route| route.obsolete && route.is_empty())
        {
            if let Some(route) = self.routes.remove(&key) {
                event!(Level::INFO, route = %route.id, "Removing obsolete route");
            }
        }
    }

    /// Marks every route whose rule is not part of `rules` as obsolete.
    ///
    /// Obsolete routes keep serving their existing clients, but new clients
    /// are given new routes. Routes whose rule is unchanged follow the
    /// equal rule of `rules` from now on.
    pub(crate) fn reload(&mut self, rules: &Rules) {
        for route in self.routes.values_mut() {
            if route.obsolete {
                continue;
            }
            match rules.find(&route.rule) {
                Some(rule) => route.rule = rule.clone(),
                None => {
                    event!(Level::INFO, route = %route.id, "Route is now obsolete");
                    route.obsolete = true;
                }
            }
        }
    }

    /// Finds the first server in `state`, across all routes, which
    /// satisfies a predicate.
    pub(crate) fn find_server<F>(&self, state: ServerState, mut pred: F) -> Option<(RouteKey, Key)>
    where
        F: FnMut(&ServerEntry) -> bool,
    {
        self.routes.iter().find_map(|(route_key, route)| {
            route
                .servers
                .find(state, &mut pred)
                .map(|server_key| (*route_key, server_key))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::Rule;
    use crate::ServerId;

    fn rules() -> Rules {
        Rules::new(
            vec![
                Rule {
                    database: "analytics".to_string(),
                    storage_db: Some("warehouse".to_string()),
                    storage_user: Some("etl".to_string()),
                    ..Default::default()
                },
                Rule {
                    database: "app".to_string(),
                    ..Default::default()
                },
            ],
            None,
        )
    }

    #[test]
    fn test_match_is_idempotent() {
        let mut pool = RoutePool::new();
        let rules = rules();

        let a = pool.match_or_create(&rules, "app", "alice").unwrap();
        let b = pool.match_or_create(&rules, "app", "alice").unwrap();
        let c = pool.match_or_create(&rules, "app", "bob").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);

        assert_eq!(
            pool.match_or_create(&rules, "missing", "alice"),
            Err(MatchError::NotFound)
        );
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_substitution_shares_route() {
        let mut pool = RoutePool::new();
        let rules = rules();

        let a = pool.match_or_create(&rules, "analytics", "alice").unwrap();
        let b = pool.match_or_create(&rules, "analytics", "bob").unwrap();
        assert_eq!(a, b);

        let route = pool.get(a).unwrap();
        assert_eq!(route.id, RouteId::new("warehouse", "etl"));
    }

    #[test]
    fn test_substitution_does_not_share_routes_across_rules() {
        let mut pool = RoutePool::new();
        let rules = Rules::new(
            vec![Rule {
                database: "analytics".to_string(),
                storage_db: Some("app".to_string()),
                ..Default::default()
            }],
            Some(Rule {
                password: Some("secret".to_string()),
                ..Default::default()
            }),
        );

        let analytics = pool.match_or_create(&rules, "analytics", "u").unwrap();
        let app = pool.match_or_create(&rules, "app", "u").unwrap();
        assert_ne!(analytics, app);

        // Same target, but each client follows its own rule.
        assert_eq!(pool.get(analytics).unwrap().id, pool.get(app).unwrap().id);
        assert_eq!(pool.get(analytics).unwrap().rule.password, None);
        assert_eq!(
            pool.get(app).unwrap().rule.password.as_deref(),
            Some("secret")
        );
        assert_eq!(pool.match_or_create(&rules, "app", "u").unwrap(), app);
    }

    #[test]
    fn test_reload_keeps_unchanged_routes() {
        let mut pool = RoutePool::new();
        let old = rules();
        let app = pool.match_or_create(&old, "app", "alice").unwrap();

        // An equal rule, loaded again.
        let new = rules();
        pool.reload(&new);
        assert!(!pool.get(app).unwrap().obsolete);
        assert_eq!(pool.match_or_create(&new, "app", "alice").unwrap(), app);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_reload_and_gc() {
        let mut pool = RoutePool::new();
        let old = rules();
        let app = pool.match_or_create(&old, "app", "alice").unwrap();
        let analytics = pool.match_or_create(&old, "analytics", "alice").unwrap();

        // Keep the analytics route busy
        pool.get_mut(analytics)
            .unwrap()
            .servers
            .insert(ServerEntry::new(ServerId::new()), ServerState::Idle);

        let new = Rules::new(
            vec![Rule {
                database: "app".to_string(),
                pool_size: 8,
                ..Default::default()
            }],
            None,
        );
        pool.reload(&new);
        assert!(pool.get(app).unwrap().obsolete);
        assert!(pool.get(analytics).unwrap().obsolete);

        // A new client gets a new route, following the new rule.
        let fresh = pool.match_or_create(&new, "app", "alice").unwrap();
        assert_ne!(fresh, app);
        assert_eq!(pool.get(fresh).unwrap().rule.pool_size, 8);

        pool.gc();
        assert!(pool.get(app).is_none(), "Empty obsolete route is freed");
        assert!(pool.get(analytics).is_some(), "Busy route survives");
        assert!(pool.get(fresh).is_some(), "Current route survives");
    }

    #[test]
    fn test_find_server() {
        let mut pool = RoutePool::new();
        let rules = rules();
        let a = pool.match_or_create(&rules, "app", "alice").unwrap();
        let b = pool.match_or_create(&rules, "app", "bob").unwrap();

        let id = ServerId::new();
        let server = pool
            .get_mut(b)
            .unwrap()
            .servers
            .insert(ServerEntry::new(id), ServerState::Active);
        pool.get_mut(a)
            .unwrap()
            .servers
            .insert(ServerEntry::new(ServerId::new()), ServerState::Idle);

        assert_eq!(
            pool.find_server(ServerState::Active, |entry| entry.id == id),
            Some((b, server))
        );
        assert_eq!(
            pool.find_server(ServerState::Active, |entry| entry.id != id),
            None
        );
    }
}
