//! One-shot completion futures for long-running backend operations.
//!
//! Every mutating cloud operation runs in an operation-local worker task that
//! deposits exactly one result and exits. The caller holds a [`Pending`]
//! handle and decides how long it is willing to wait; an abandoned worker
//! keeps polling harmlessly until it finishes, at which point its result is
//! discarded.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;

use super::BackendError;

/// Handle to an operation that will complete exactly once.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, BackendError>>,
}

impl<T: Send + 'static> Pending<T> {
    /// Spawns `operation` on the runtime and returns a handle to its eventual
    /// result. Dropping the handle abandons the worker without cancelling it.
    pub fn spawn<F>(operation: F) -> Self
    where
        F: Future<Output = Result<T, BackendError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tx.send(operation.await).ok();
        });
        Self { rx }
    }

    /// Wraps an already-known result. Used for operations that fail before
    /// any asynchronous work starts, and by test doubles.
    #[must_use]
    pub fn ready(result: Result<T, BackendError>) -> Self {
        let (tx, rx) = oneshot::channel();
        tx.send(result).ok();
        Self { rx }
    }

    /// Returns a handle that never completes. Only useful for exercising
    /// timeout paths in tests.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = oneshot::channel();
        std::mem::forget(tx);
        Self { rx }
    }

    /// Races the operation against a deadline.
    ///
    /// `action` names the operation in the timeout error, e.g. `"instance
    /// creation"`.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error when it fails, a
    /// [`BackendError::Timeout`] when `limit` elapses first, and a
    /// [`BackendError::Provider`] when the worker exits without reporting.
    pub async fn await_within(self, limit: Duration, action: &str) -> Result<T, BackendError> {
        match tokio::time::timeout(limit, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv)) => Err(BackendError::Provider {
                message: format!("worker for {action} exited without reporting a result"),
            }),
            Err(_elapsed) => Err(BackendError::Timeout {
                action: action.to_owned(),
            }),
        }
    }

    /// Waits for the operation with no deadline, propagating whatever result
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or [`BackendError::Provider`] when
    /// the worker exits without reporting.
    pub async fn wait(self, action: &str) -> Result<T, BackendError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_recv) => Err(BackendError::Provider {
                message: format!("worker for {action} exited without reporting a result"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn ready_value_wins_the_race() {
        let pending = Pending::ready(Ok(7_u32));
        let result = pending
            .await_within(Duration::from_secs(5), "ready value")
            .await;
        assert!(matches!(result, Ok(7)), "unexpected result: {result:?}");
    }

    #[tokio::test]
    async fn spawned_operation_delivers_before_deadline() {
        let pending = Pending::spawn(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(String::from("done"))
        });
        let result = pending
            .await_within(Duration::from_secs(5), "spawned operation")
            .await;
        assert!(
            matches!(result, Ok(ref value) if value == "done"),
            "unexpected result: {result:?}"
        );
    }

    #[tokio::test]
    async fn silent_operation_times_out_near_the_deadline() {
        let limit = Duration::from_millis(50);
        let started = Instant::now();
        let result = Pending::<()>::never()
            .await_within(limit, "silent operation")
            .await;
        let elapsed = started.elapsed();

        assert!(
            matches!(result, Err(BackendError::Timeout { ref action }) if action == "silent operation"),
            "unexpected result: {result:?}"
        );
        assert!(elapsed >= limit, "timed out early after {elapsed:?}");
        assert!(
            elapsed < Duration::from_secs(5),
            "timed out far too late after {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn dropped_worker_reports_a_provider_error() {
        let (tx, rx) = tokio::sync::oneshot::channel::<Result<(), BackendError>>();
        drop(tx);
        let pending = Pending { rx };
        let result = pending
            .await_within(Duration::from_secs(1), "dropped worker")
            .await;
        assert!(
            matches!(result, Err(BackendError::Provider { .. })),
            "unexpected result: {result:?}"
        );
    }
}
