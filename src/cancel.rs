//! Cancellation of queries running on a backend.
//!
//! A cancel request travels on a connection of its own: the pooler opens a
//! new connection to the backend, sends a CancelRequest carrying the key the
//! backend handed out during setup, and hangs up.

use crate::backend::{Backend, Connector, Dialer, Error};
#[cfg(feature = "probes")]
use crate::probes;
use crate::protocol::{self, CancelKey};
use crate::stream::PgStream;

use tracing::{event, Level};

pub(crate) async fn cancel(
    connector: &dyn Connector,
    backend: &Backend,
    key: CancelKey,
) -> Result<(), Error> {
    #[cfg(feature = "probes")]
    probes::cancel!(|| (backend.to_string(), u64::from(key.pid)));

    let io = connector.connect(backend).await?;
    let mut stream = PgStream::new(io);
    protocol::put_cancel_request(stream.write_buf(), key);
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

/// Sends a cancel request in the background.
///
/// The outcome is only logged: the client asking for the cancellation gets
/// no reply either way.
pub(crate) fn spawn_cancel(dialer: Dialer, backend: Backend, key: CancelKey) {
    tokio::task::spawn(async move {
        match dialer.cancel(&backend, key).await {
            Ok(()) => event!(Level::DEBUG, %backend, pid = key.pid, "Sent cancel request"),
            Err(err) => {
                event!(Level::WARN, %backend, pid = key.pid, ?err, "Failed to send cancel request")
            }
        }
    });
}
