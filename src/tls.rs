//! The interface for negotiating TLS.
//!
//! pgorb does not construct TLS contexts itself: an implementation of [Tls]
//! wraps a connection once the PostgreSQL-level negotiation (an SSLRequest
//! answered with `S`) has happened.

use crate::backend::BoxedIo;

use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Tls: Send + Sync {
    /// Starts a TLS session on a connection to a backend named `host`.
    async fn connect(&self, io: BoxedIo, host: &str) -> std::io::Result<BoxedIo>;

    /// Accepts a TLS session on a connection from a client.
    async fn accept(&self, io: BoxedIo) -> std::io::Result<BoxedIo>;
}

pub type SharedTls = Arc<dyn Tls>;
