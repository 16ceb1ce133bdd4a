//! Cancellation for one execution.
//!
//! A [`CancelScope`] merges every source that may stop an execution (the caller's token, the
//! owning client's session, the command timeout, disposal of the result stream) into one
//! `CancellationToken`, remembering which source fired first.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{CancelReason, SqlConduitError};

#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
    finished: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            finished: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Cancel with `reason`. Returns `false` when the scope was already cancelled or finished,
    /// in which case nothing changes.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        if self.finished.is_cancelled() || self.reason.set(reason).is_err() {
            return false;
        }
        self.token.cancel();
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// `Cancelled` error carrying the recorded reason.
    #[must_use]
    pub fn error(&self) -> SqlConduitError {
        SqlConduitError::Cancelled(self.reason().unwrap_or(CancelReason::Caller))
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(CancelReason::Caller)
    }

    /// The execution is over; later cancellation requests become no-ops and watchers exit.
    pub fn finish(&self) {
        self.finished.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Forward `source` into this scope as `reason` until the scope finishes.
    pub fn link(&self, source: &CancellationToken, reason: CancelReason) {
        if source.is_cancelled() {
            self.cancel(reason);
            return;
        }
        let scope = self.clone();
        let source = source.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = source.cancelled() => {
                    scope.cancel(reason);
                }
                () = scope.finished.cancelled() => {}
                () = scope.token.cancelled() => {}
            }
        });
    }

    /// Cancel with [`CancelReason::Timeout`] once `timeout` elapses, unless finished first.
    pub fn arm_timeout(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return;
        };
        let scope = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    scope.cancel(CancelReason::Timeout);
                }
                () = scope.finished.cancelled() => {}
                () = scope.token.cancelled() => {}
            }
        });
    }

    /// Guard that cancels the scope with [`CancelReason::Disposed`] when dropped.
    #[must_use]
    pub fn dispose_guard(&self) -> DropGuard {
        let disposed = CancellationToken::new();
        self.link(&disposed, CancelReason::Disposed);
        disposed.drop_guard()
    }
}
