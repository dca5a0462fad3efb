//! Helpers for joining terminating tasks

use tokio::task::JoinError;
use tracing::{event, Level};

/// Re-raises the panic of a task which must not fail, such as the router.
pub(crate) fn propagate_panics(result: Result<(), JoinError>) {
    match result {
        // Success or cancellation: Quietly return
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        // Propagate panics
        Err(err) if err.is_panic() => {
            std::panic::resume_unwind(err.into_panic());
        }
        Err(err) => {
            panic!("Unexpected join error (other than panic or cancellation): {err}");
        }
    }
}

/// Logs the panic of a client session.
///
/// A session which panics takes its own client with it, and nothing else:
/// its [crate::claim::Handle] and [crate::claim::Ticket] give everything
/// back to the router as they unwind.
pub(crate) fn reap_session(result: Result<(), JoinError>) {
    match result {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        Err(err) => event!(Level::ERROR, ?err, "Client session panicked"),
    }
}
