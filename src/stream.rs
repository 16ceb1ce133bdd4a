//! Nested result streaming.
//!
//! An execution publishes an outer [`ResultStream`] of [`ResultHandle`]s; each handle opens a
//! [`RecordStream`] over that result's rows. A producer task owns the physical connection and
//! feeds both levels through bounded channels, so a slow consumer applies backpressure without
//! ever touching the connection itself.
//!
//! Results arrive strictly in server order. A handle's records must be drained (or the handle
//! abandoned) before the next handle can arrive once its channel fills up.

use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::cancel::CancelScope;
use crate::error::SqlConduitError;
use crate::results::OutputParameters;

mod pipeline;
mod results;

pub(crate) use pipeline::spawn;
pub use results::{RecordStream, ResultHandle, ResultStream};

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Idle,
    /// The batch has been submitted and no result header has arrived yet.
    Executing,
    EmittingResults,
    /// The server finished; the connection is being handed back.
    Draining,
    Completed,
    Cancelled,
    Faulted,
}

impl ExecutionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Cancelled | ExecutionState::Faulted
        )
    }
}

#[derive(Debug, Default)]
pub(crate) struct ExecutionShared {
    pub(crate) error: OnceLock<SqlConduitError>,
    pub(crate) outputs: OnceLock<OutputParameters>,
    pub(crate) rows_affected: OnceLock<u64>,
}

/// Observes and controls one execution. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    state: watch::Receiver<ExecutionState>,
    scope: CancelScope,
    shared: Arc<ExecutionShared>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        state: watch::Receiver<ExecutionState>,
        scope: CancelScope,
        shared: Arc<ExecutionShared>,
    ) -> Self {
        Self {
            state,
            scope,
            shared,
        }
    }

    #[must_use]
    pub fn state(&self) -> ExecutionState {
        *self.state.borrow()
    }

    /// Request cancellation. A no-op once the execution has finished or was already cancelled.
    pub fn cancel(&self) {
        self.scope.cancel(crate::error::CancelReason::Caller);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> ExecutionState {
        let mut rx = self.state.clone();
        let reached = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => Some(*state),
            Err(_) => None,
        };
        reached.unwrap_or_else(|| *rx.borrow())
    }

    /// Output parameter values; `None` until the execution has completed.
    #[must_use]
    pub fn output_parameters(&self) -> Option<OutputParameters> {
        self.shared.outputs.get().cloned()
    }

    /// Total rows affected reported by the server; `None` until completion.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.shared.rows_affected.get().copied()
    }

    /// The error that ended the execution, if it did not complete.
    ///
    /// A cancel that arrives after the server finished does not turn a completed execution into
    /// a cancelled one.
    #[must_use]
    pub fn error(&self) -> Option<SqlConduitError> {
        if let Some(err) = self.shared.error.get() {
            return Some(err.clone());
        }
        if self.state() == ExecutionState::Completed {
            return None;
        }
        self.scope.is_cancelled().then(|| self.scope.error())
    }

    /// Resolves once the producer is done: any abort attempted and the connection handed back.
    pub(crate) fn settled(&self) -> BoxFuture<'static, ExecutionState> {
        let execution = self.clone();
        async move { execution.wait().await }.boxed()
    }

    pub(crate) fn scope(&self) -> &CancelScope {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::CancelReason;

    fn execution(
        state: ExecutionState,
    ) -> (watch::Sender<ExecutionState>, Arc<ExecutionShared>, ExecutionHandle) {
        let (tx, rx) = watch::channel(state);
        let shared = Arc::new(ExecutionShared::default());
        let handle = ExecutionHandle::new(rx, CancelScope::new(), Arc::clone(&shared));
        (tx, shared, handle)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancel_racing_completion_is_not_an_error() {
        let (state, _shared, execution) = execution(ExecutionState::Draining);
        let (outer_tx, outer_rx) = mpsc::channel::<ResultHandle>(1);
        let mut results =
            ResultStream::new(outer_rx, execution.clone(), execution.scope().dispose_guard());

        execution.cancel();
        state.send_replace(ExecutionState::Completed);
        drop(outer_tx);

        assert!(execution.error().is_none());
        assert!(results.next().await.is_none());
        assert_eq!(execution.state(), ExecutionState::Completed);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_stream_reports_only_after_the_producer_stopped() {
        let (state, shared, execution) = execution(ExecutionState::EmittingResults);
        let (outer_tx, outer_rx) = mpsc::channel::<ResultHandle>(1);
        let mut results =
            ResultStream::new(outer_rx, execution.clone(), execution.scope().dispose_guard());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = shared
                .error
                .set(SqlConduitError::Cancelled(CancelReason::Caller));
            state.send_replace(ExecutionState::Cancelled);
            drop(outer_tx);
        });
        results.cancel();

        let item = results.next().await.expect("terminal item");
        assert_eq!(execution.state(), ExecutionState::Cancelled);
        assert!(matches!(
            item,
            Err(SqlConduitError::Cancelled(CancelReason::Caller))
        ));
        assert!(results.next().await.is_none());
    }
}
