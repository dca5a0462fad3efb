//! The entry point: accepts clients, and owns the router serving them.

use crate::auth::SharedAuthenticator;
use crate::backend::{BoxedIo, Dialer, SharedConnector};
use crate::config::Config;
use crate::frontend::{self, Context};
use crate::join;
use crate::policy::Rules;
use crate::route::{RouteId, RouteStats};
use crate::router::{Error, Router};
use crate::tls::SharedTls;
use crate::ClientId;

use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{event, instrument, Level};

/// A PostgreSQL connection pooler.
///
/// Dropping the pooler aborts its router. Sessions which are still running
/// fail on their next request to it.
pub struct Pooler {
    ctx: Arc<Context>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Describes a failure to register USDT probes.
///
/// Contains the pooler itself, which works fine without its probes.
pub struct RegistrationError(Pooler);

impl std::fmt::Debug for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl RegistrationError {
    /// Consume the error and get access to the contained pooler.
    pub fn into_inner(self) -> Pooler {
        self.0
    }
}

impl Pooler {
    /// Creates a new pooler, and starts its router.
    ///
    /// - config: The routes, and the limits applying to them.
    /// - connector: Describes how connections to backends are made.
    /// - auth: Authenticates clients, and answers backends asking for a
    ///   password.
    /// - tls: If set, clients asking for TLS get it.
    ///
    /// ```no_run
    /// use pgorb::auth::Basic;
    /// use pgorb::config::Config;
    /// use pgorb::connectors::tcp::TcpConnector;
    /// use pgorb::pooler::Pooler;
    /// use std::sync::Arc;
    ///
    /// # async {
    /// let config = Config::from_toml(r#"
    ///     [default]
    ///     pool = "transaction"
    ///     storage = { host = "127.0.0.1", port = 5432 }
    /// "#).unwrap();
    /// let listener = tokio::net::TcpListener::bind(config.listen).await.unwrap();
    ///
    /// let pooler = Pooler::new(
    ///     &config,
    ///     Arc::new(TcpConnector::new()),
    ///     Arc::new(Basic),
    ///     None,
    /// ).unwrap();
    /// pooler.serve(listener).await;
    /// # };
    /// ```
    ///
    /// Note that if the `"probes"` feature is not enabled, this method is
    /// infallible.
    #[instrument(skip_all, fields(listen = %config.listen), name = "Pooler::new")]
    pub fn new(
        config: &Config,
        connector: SharedConnector,
        auth: SharedAuthenticator,
        tls: Option<SharedTls>,
    ) -> Result<Self, RegistrationError> {
        let dialer = Dialer::new(connector, auth.clone(), config.connect_timeout());
        let (router, handle) = Router::spawn(config, dialer.clone());
        let self_ = Self {
            ctx: Arc::new(Context {
                router,
                dialer,
                auth,
                tls,
                pipelining: config.pipelining,
            }),
            handle: Mutex::new(Some(handle)),
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    /// Returns the router, to route and attach clients directly.
    pub fn router(&self) -> &Router {
        &self.ctx.router
    }

    /// Samples the state of every route.
    pub async fn stats(&self) -> Result<Vec<(RouteId, RouteStats)>, Error> {
        self.ctx.router.stats().await
    }

    /// Replaces the rules clients are routed by.
    ///
    /// Routes whose rule no longer exists are retired once their clients
    /// leave. New clients get routes under the new rules.
    pub async fn reload(&self, rules: Rules) -> Result<(), Error> {
        self.ctx.router.reload(rules).await
    }

    /// Serves a single client connection, in a task of its own.
    pub fn spawn_session(&self, io: BoxedIo) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::task::spawn(async move { frontend::run(&ctx, ClientId::new(), io).await })
    }

    /// Accepts clients from `listener`, forever.
    ///
    /// Dropping the returned future stops accepting, and aborts every
    /// session it started.
    #[instrument(skip_all, name = "Pooler::serve")]
    pub async fn serve(&self, listener: TcpListener) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            event!(Level::WARN, ?err, "Failed to accept client");
                            continue;
                        }
                    };
                    if let Err(err) = stream.set_nodelay(true) {
                        event!(Level::WARN, ?err, %addr, "Failed to set TCP_NODELAY");
                    }
                    let id = ClientId::new();
                    event!(Level::DEBUG, client = %id, %addr, "Accepted client");
                    let ctx = self.ctx.clone();
                    sessions.spawn(async move {
                        frontend::run(&ctx, id, Box::new(stream)).await
                    });
                }
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    join::reap_session(result);
                }
            }
        }
    }

    /// Terminates the router.
    ///
    /// Waiting clients fail, and idle servers are closed. Servers still
    /// attached to clients are closed as they come back.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.ctx.router.terminate().await?;
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return Ok(());
        };
        join::propagate_panics(handle.await);
        Ok(())
    }
}

impl Drop for Pooler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
