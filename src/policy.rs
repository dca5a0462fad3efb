//! Routing rules, which decide where and how clients are pooled.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// How long a server stays bound to a client.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingMode {
    /// A server is held until the client disconnects.
    #[default]
    Session,

    /// A server is held until the client's transaction ends.
    Transaction,
}

/// The backend address a route connects to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Storage {
    pub host: String,
    pub port: u16,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
        }
    }
}

/// Policy for every client which matches a (database, user) pair.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Rule {
    /// The database this rule matches. Ignored for the default rule.
    pub database: String,

    /// The user this rule matches, or any user if unset.
    pub user: Option<String>,

    pub storage: Storage,

    /// If set, clients are connected to this database instead of the one
    /// they asked for.
    pub storage_db: Option<String>,

    /// If set, clients are connected as this user instead of their own.
    pub storage_user: Option<String>,

    /// Answers password requests from the backend.
    pub storage_password: Option<String>,

    /// If set, clients must present this password.
    pub password: Option<String>,

    pub pool: PoolingMode,

    /// The maximum number of servers for one route. Zero means unbounded.
    pub pool_size: usize,

    /// How long a client waits for a server when the route is at
    /// `pool_size`. Zero means the client fails immediately.
    pub pool_timeout_ms: u64,

    /// The maximum number of clients for one route. Zero means unbounded.
    pub client_max: usize,

    /// Idle servers are closed after this many seconds. Zero disables
    /// expiry.
    pub ttl: u64,

    /// Roll back open transactions of returned servers.
    pub pool_rollback: bool,

    /// Issue "DISCARD ALL" on returned servers.
    pub pool_discard: bool,

    /// Cancel in-flight queries of returned servers.
    pub pool_cancel: bool,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            database: String::new(),
            user: None,
            storage: Storage::default(),
            storage_db: None,
            storage_user: None,
            storage_password: None,
            password: None,
            pool: PoolingMode::Session,
            pool_size: 0,
            pool_timeout_ms: 0,
            client_max: 0,
            ttl: 0,
            pool_rollback: true,
            pool_discard: false,
            pool_cancel: true,
        }
    }
}

impl Rule {
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    fn matches(&self, database: &str, user: &str) -> bool {
        self.database == database && self.user.as_deref().is_none_or(|u| u == user)
    }
}

/// The full set of routing rules.
#[derive(Clone, Debug, Default)]
pub struct Rules {
    rules: Vec<Arc<Rule>>,
    default: Option<Arc<Rule>>,
}

impl Rules {
    pub fn new(rules: Vec<Rule>, default: Option<Rule>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            default: default.map(Arc::new),
        }
    }

    /// Finds the rule for a client.
    ///
    /// The first rule naming the database (and, if the rule names one, the
    /// user) wins. Otherwise the default rule applies, if there is one.
    pub fn matching(&self, database: &str, user: &str) -> Option<&Arc<Rule>> {
        self.rules
            .iter()
            .find(|rule| rule.matches(database, user))
            .or(self.default.as_ref())
    }

    /// Finds the rule of this set which is equal to `rule`.
    pub fn find(&self, rule: &Rule) -> Option<&Arc<Rule>> {
        self.rules
            .iter()
            .chain(self.default.iter())
            .find(|r| r.as_ref() == rule)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rule(database: &str, user: Option<&str>) -> Rule {
        Rule {
            database: database.to_string(),
            user: user.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_matching_prefers_first_rule() {
        let rules = Rules::new(
            vec![
                rule("app", Some("admin")),
                rule("app", None),
                rule("other", None),
            ],
            Some(rule("", None)),
        );

        let admin = rules.matching("app", "admin").unwrap();
        assert_eq!(admin.user.as_deref(), Some("admin"));

        let anyone = rules.matching("app", "reader").unwrap();
        assert_eq!(anyone.user, None);
        assert_eq!(anyone.database, "app");

        let fallback = rules.matching("missing", "reader").unwrap();
        assert_eq!(fallback.database, "");

        // Matching is deterministic.
        assert!(Arc::ptr_eq(
            rules.matching("app", "reader").unwrap(),
            rules.matching("app", "reader").unwrap()
        ));
    }

    #[test]
    fn test_no_default_rule() {
        let rules = Rules::new(vec![rule("app", None)], None);
        assert!(rules.matching("nope", "user").is_none());
    }
}
