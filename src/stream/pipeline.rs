use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cancel::CancelScope;
use crate::config::ClientOptions;
use crate::driver::{Command, WireEvent};
use crate::error::{CancelReason, SqlConduitError};
use crate::executor::Lease;
use crate::pool::PhysicalConnection;
use crate::results::{OutputParameters, Record, ResultColumns};
use crate::types::RowValues;

use super::results::{ResultHandle, ResultShared, ResultStream};
use super::{ExecutionHandle, ExecutionShared, ExecutionState};

/// Start the producer for `command` on `lease` and return the consumer side.
///
/// The returned stream is wired but nothing has been read yet; the batch itself is submitted
/// by the producer task.
pub(crate) fn spawn(
    lease: Lease,
    command: Command,
    scope: CancelScope,
    options: &ClientOptions,
) -> ResultStream {
    let (outer_tx, outer_rx) = mpsc::channel(options.result_capacity);
    let (state_tx, state_rx) = watch::channel(ExecutionState::Idle);
    let shared = Arc::new(ExecutionShared::default());
    let execution = ExecutionHandle::new(state_rx, scope.clone(), Arc::clone(&shared));
    let dispose = scope.dispose_guard();

    let producer = Producer {
        scope,
        state: state_tx,
        shared,
        execution: execution.clone(),
        outer: outer_tx,
        record_capacity: options.stream_capacity,
        current: None,
        next_index: 0,
        outputs: None,
        rows_affected: 0,
    };
    tokio::spawn(producer.run(lease, command));
    ResultStream::new(outer_rx, execution, dispose)
}

enum Outcome {
    Completed,
    Cancelled {
        reason: CancelReason,
        /// The batch was submitted, so the server may still be running it.
        in_flight: bool,
    },
    Failed(SqlConduitError),
}

struct CurrentResult {
    /// `None` once the consumer abandoned the result.
    tx: Option<mpsc::Sender<Record>>,
    columns: Arc<ResultColumns>,
    shared: Arc<ResultShared>,
}

struct Producer {
    scope: CancelScope,
    state: watch::Sender<ExecutionState>,
    shared: Arc<ExecutionShared>,
    execution: ExecutionHandle,
    outer: mpsc::Sender<ResultHandle>,
    record_capacity: usize,
    current: Option<CurrentResult>,
    next_index: usize,
    outputs: Option<Vec<(String, RowValues)>>,
    rows_affected: u64,
}

impl Producer {
    async fn run(mut self, mut lease: Lease, command: Command) {
        let label = command.describe();
        let abort = lease.abort_handle();
        let outcome = self.drive(&mut lease, &command).await;

        let terminal = match outcome {
            Outcome::Completed => {
                self.set_state(ExecutionState::Draining);
                let outputs = OutputParameters::new(self.outputs.take().unwrap_or_default());
                let _ = self.shared.outputs.set(outputs);
                let _ = self.shared.rows_affected.set(self.rows_affected);
                // Guard against a late cancel turning a finished execution into a failure.
                self.scope.finish();
                debug!(command = %label, rows = self.rows_affected, "execution completed");
                ExecutionState::Completed
            }
            Outcome::Cancelled { reason, in_flight } => {
                if in_flight {
                    info!(command = %label, %reason, "aborting in-flight execution");
                    if let Err(err) = abort.abort().await {
                        warn!(command = %label, error = %err, "abort signal failed");
                    }
                    lease.mark_needs_validation();
                } else {
                    debug!(command = %label, %reason, "cancelled before submission");
                }
                let _ = self.shared.error.set(SqlConduitError::Cancelled(reason));
                ExecutionState::Cancelled
            }
            Outcome::Failed(err) => {
                if err.is_connection_fatal() {
                    lease.mark_broken();
                }
                warn!(command = %label, error = %err, "execution failed");
                let _ = self.shared.error.set(err);
                ExecutionState::Faulted
            }
        };

        lease.finish().await;
        self.current = None;
        self.scope.finish();
        self.set_state(terminal);
        // Dropping `self` closes the outer stream.
    }

    async fn drive(&mut self, conn: &mut PhysicalConnection, command: &Command) -> Outcome {
        if self.scope.is_cancelled() {
            return Outcome::Cancelled {
                reason: self.scope.reason().unwrap_or(CancelReason::Caller),
                in_flight: false,
            };
        }
        let scope = self.scope.clone();
        let mut wire = conn.execute(command);
        self.set_state(ExecutionState::Executing);

        loop {
            let event = tokio::select! {
                biased;
                reason = scope.cancelled() => {
                    return Outcome::Cancelled { reason, in_flight: true };
                }
                event = wire.next() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(err)) => return Outcome::Failed(err),
                None => {
                    return Outcome::Failed(SqlConduitError::Faulted(
                        "connection stopped before the batch completed".into(),
                    ));
                }
            };

            match event {
                WireEvent::Header(headers) => {
                    self.end_result(None);
                    let columns = Arc::new(ResultColumns::new(headers));
                    let (tx, rx) = mpsc::channel(self.record_capacity);
                    let result = Arc::new(ResultShared::default());
                    let handle = ResultHandle::new(
                        self.next_index,
                        Arc::clone(&columns),
                        rx,
                        Arc::clone(&result),
                        self.execution.clone(),
                    );
                    debug!(index = self.next_index, columns = columns.len(), "result started");
                    self.next_index += 1;
                    self.set_state(ExecutionState::EmittingResults);
                    tokio::select! {
                        biased;
                        reason = scope.cancelled() => {
                            return Outcome::Cancelled { reason, in_flight: true };
                        }
                        sent = self.outer.send(handle) => {
                            if sent.is_err() {
                                return Outcome::Cancelled {
                                    reason: CancelReason::Disposed,
                                    in_flight: true,
                                };
                            }
                        }
                    }
                    self.current = Some(CurrentResult {
                        tx: Some(tx),
                        columns,
                        shared: result,
                    });
                }
                WireEvent::Row(values) => {
                    let Some(current) = self.current.as_mut() else {
                        return Outcome::Failed(SqlConduitError::Faulted(
                            "row received outside of a result".into(),
                        ));
                    };
                    let Some(tx) = current.tx.as_ref() else {
                        continue;
                    };
                    let record = Record::new(Arc::clone(&current.columns), values);
                    tokio::select! {
                        biased;
                        reason = scope.cancelled() => {
                            return Outcome::Cancelled { reason, in_flight: true };
                        }
                        sent = tx.send(record) => {
                            if sent.is_err() {
                                debug!("result abandoned; discarding its remaining rows");
                                current.tx = None;
                            }
                        }
                    }
                }
                WireEvent::ResultEnd { rows_affected } => self.end_result(rows_affected),
                WireEvent::Progress(message) => debug!(%message, "server progress"),
                WireEvent::Output(values) => self.outputs = Some(values),
                WireEvent::Done { rows_affected } => {
                    self.end_result(None);
                    self.rows_affected = rows_affected;
                    return Outcome::Completed;
                }
            }
        }
    }

    /// Close the current result cleanly.
    fn end_result(&mut self, rows_affected: Option<u64>) {
        if let Some(current) = self.current.take() {
            let _ = current.shared.rows_affected.set(rows_affected);
        }
    }

    fn set_state(&self, state: ExecutionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "execution state");
        }
    }
}
