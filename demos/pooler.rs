//! Runs pgorb as a standalone pooler.
//!
//! ```text
//! pgorb --config pgorb.toml
//! ```
//!
//! Logging is controlled through `RUST_LOG`. Sending SIGHUP reloads the
//! routing rules from the same file.

use clap::Parser;
use pgorb::auth::Basic;
use pgorb::config::Config;
use pgorb::connectors::tcp::TcpConnector;
use pgorb::pooler::Pooler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "PostgreSQL connection pooler")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides the configured listen address
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,
}

fn tracing() {
    use tracing_subscriber::fmt::format::format;
    tracing_subscriber::fmt()
        .event_format(format().compact())
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[cfg(unix)]
async fn reload_on_hangup(pooler: Arc<Pooler>, path: PathBuf) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        match Config::load(&path) {
            Ok(config) => {
                pooler.reload(config.rules()).await?;
                event!(Level::INFO, path = %path.display(), "Reloaded rules");
            }
            Err(err) => event!(Level::ERROR, ?err, "Failed to reload config"),
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn reload_on_hangup(_pooler: Arc<Pooler>, _path: PathBuf) -> anyhow::Result<()> {
    std::future::pending().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing();

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let listener = TcpListener::bind(config.listen).await?;
    event!(Level::INFO, listen = %config.listen, "Listening");

    let pooler = match Pooler::new(
        &config,
        Arc::new(TcpConnector::new()),
        Arc::new(Basic),
        None,
    ) {
        Ok(pooler) => pooler,
        Err(err) => {
            event!(Level::WARN, %err, "Running without probes");
            err.into_inner()
        }
    };
    let pooler = Arc::new(pooler);

    tokio::select! {
        _ = pooler.serve(listener) => (),
        result = reload_on_hangup(pooler.clone(), args.config.clone()) => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            event!(Level::INFO, "Shutting down");
        }
    }
    pooler.terminate().await?;
    Ok(())
}
