//! Time-bounded store and catalog calls.

use std::future::Future;
use std::time::Duration;

use crate::error::CallTimedOut;

/// Await `fut` for at most `timeout`, converting both its error and an
/// expired deadline into `R`.
pub(crate) async fn bounded<T, E, R>(
    operation: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, R>
where
    R: From<E> + From<CallTimedOut>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(R::from),
        Err(_) => Err(R::from(CallTimedOut {
            operation: operation.to_string(),
            timeout,
        })),
    }
}
