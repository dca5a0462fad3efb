//! Process-wide configuration, loaded from TOML.
//!
//! ```toml
//! listen = "127.0.0.1:6432"
//! client_max = 1000
//!
//! [default]
//! storage = { host = "127.0.0.1", port = 5432 }
//! pool = "transaction"
//! pool_size = 16
//!
//! [[rule]]
//! database = "analytics"
//! storage_db = "warehouse"
//! ttl = 60
//! ```

use crate::policy::{Rule, Rules};

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to read configuration")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The address clients connect to.
    pub listen: SocketAddr,

    /// The maximum number of routed clients, across all routes. Zero means
    /// unbounded.
    pub client_max: usize,

    /// How long to wait for a backend connection to be established.
    pub connect_timeout_ms: u64,

    /// Server replies are flushed to the client once this many bytes are
    /// buffered.
    pub pipelining: usize,

    /// How often per-route stats are logged, in seconds. Zero disables
    /// stats logging.
    pub stats_interval: u64,

    #[serde(rename = "rule")]
    pub rules: Vec<Rule>,

    /// The rule for clients which match no other rule.
    pub default: Option<Rule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 6432)),
            client_max: 0,
            connect_timeout_ms: 5_000,
            pipelining: 32 * 1024,
            stats_interval: 0,
            rules: Vec::new(),
            default: None,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml(&s)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.rules.is_empty() && self.default.is_none() {
            return Err(Error::Invalid(
                "at least one rule or a default rule is required".to_string(),
            ));
        }
        if self.pipelining == 0 {
            return Err(Error::Invalid("pipelining must be nonzero".to_string()));
        }
        for rule in self.rules.iter().chain(self.default.iter()) {
            if rule.storage.host.is_empty() {
                return Err(Error::Invalid(format!(
                    "rule for database {:?} has no storage host",
                    rule.database
                )));
            }
        }
        for rule in &self.rules {
            if rule.database.is_empty() {
                return Err(Error::Invalid("rule is missing a database".to_string()));
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> Rules {
        Rules::new(self.rules.clone(), self.default.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::PoolingMode;

    #[test]
    fn test_parse() {
        let config = Config::from_toml(
            r#"
            listen = "0.0.0.0:7000"
            client_max = 10

            [default]
            pool = "transaction"
            pool_size = 4

            [[rule]]
            database = "analytics"
            user = "reporter"
            storage = { host = "db.internal", port = 5433 }
            storage_db = "warehouse"
            ttl = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.client_max, 10);
        assert_eq!(config.pipelining, 32 * 1024);

        let default = config.default.as_ref().unwrap();
        assert_eq!(default.pool, PoolingMode::Transaction);
        assert_eq!(default.pool_size, 4);
        assert!(default.pool_rollback);

        let rule = &config.rules[0];
        assert_eq!(rule.storage.host, "db.internal");
        assert_eq!(rule.storage.port, 5433);
        assert_eq!(rule.storage_db.as_deref(), Some("warehouse"));
        assert_eq!(rule.ttl, 60);

        let rules = config.rules();
        assert_eq!(
            rules.matching("analytics", "reporter").unwrap().ttl,
            60
        );
        assert_eq!(rules.matching("analytics", "other").unwrap().pool_size, 4);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = Config::from_toml(
            r#"
            [default]
            pool_sise = 4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_requires_a_rule() {
        let err = Config::from_toml("client_max = 5").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
