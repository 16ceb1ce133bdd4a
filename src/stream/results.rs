use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, ready};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use crate::error::SqlConduitError;
use crate::mapper::{MapMode, map_record};
use crate::results::{OutputParameters, Record, ResultColumns, ResultSet};

use super::{ExecutionHandle, ExecutionState};

/// Per-result completion marker, set when the server ends the result cleanly.
#[derive(Debug, Default)]
pub(crate) struct ResultShared {
    pub(crate) rows_affected: OnceLock<Option<u64>>,
}

/// A consumer's wait for a cancelled producer to stop.
///
/// The cancellation error is only surfaced once the producer has attempted the abort and handed
/// the connection back.
#[derive(Default)]
struct Settle {
    pending: Option<BoxFuture<'static, ExecutionState>>,
    done: bool,
}

impl Settle {
    /// `Some(err)` once a cancelled execution has stopped; `None` when not cancelled, or when the
    /// server completed before the cancel took effect.
    fn poll(
        &mut self,
        execution: &ExecutionHandle,
        cx: &mut Context<'_>,
    ) -> Poll<Option<SqlConduitError>> {
        if self.done || !execution.is_cancelled() {
            return Poll::Ready(None);
        }
        let pending = self.pending.get_or_insert_with(|| execution.settled());
        ready!(pending.poll_unpin(cx));
        self.pending = None;
        self.done = true;
        Poll::Ready(execution.error())
    }
}

/// Outer stream of one execution: one [`ResultHandle`] per result, in server order.
///
/// Ends with `None` after the last result of a completed execution, or with a single `Err` when
/// the execution was cancelled or failed. Dropping the stream before the end cancels the
/// execution, which aborts the batch on the server.
pub struct ResultStream {
    rx: mpsc::Receiver<ResultHandle>,
    execution: ExecutionHandle,
    settle: Settle,
    terminated: bool,
    _dispose: DropGuard,
}

impl ResultStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<ResultHandle>,
        execution: ExecutionHandle,
        dispose: DropGuard,
    ) -> Self {
        Self {
            rx,
            execution,
            settle: Settle::default(),
            terminated: false,
            _dispose: dispose,
        }
    }

    #[must_use]
    pub fn execution(&self) -> &ExecutionHandle {
        &self.execution
    }

    pub fn cancel(&self) {
        self.execution.cancel();
    }

    /// Drain every result and record into memory.
    ///
    /// # Errors
    /// Returns the error that ended the execution (`Cancelled`, `CommandError`, ...).
    pub async fn collect_all(mut self) -> Result<Vec<ResultSet>, SqlConduitError> {
        let mut sets = Vec::new();
        while let Some(handle) = self.next().await {
            let mut records = handle?.into_records();
            let mut set = ResultSet::new(records.index(), Arc::clone(records.columns()));
            while let Some(record) = records.next().await {
                set.push(record?);
            }
            set.rows_affected = records.rows_affected();
            sets.push(set);
        }
        Ok(sets)
    }

    /// Like [`collect_all`](Self::collect_all), also returning output parameter values.
    ///
    /// # Errors
    /// Returns the error that ended the execution.
    pub async fn collect_with_outputs(
        self,
    ) -> Result<(Vec<ResultSet>, OutputParameters), SqlConduitError> {
        let execution = self.execution.clone();
        let sets = self.collect_all().await?;
        Ok((sets, execution.output_parameters().unwrap_or_default()))
    }

    fn terminate(&mut self) -> Option<Result<ResultHandle, SqlConduitError>> {
        self.terminated = true;
        self.rx.close();
        self.execution.error().map(Err)
    }
}

impl Stream for ResultStream {
    type Item = Result<ResultHandle, SqlConduitError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.terminated {
            return Poll::Ready(None);
        }
        // Handles already buffered are not handed out once cancelled.
        if let Some(err) = ready!(this.settle.poll(&this.execution, cx)) {
            this.terminated = true;
            this.rx.close();
            return Poll::Ready(Some(Err(err)));
        }
        match ready!(this.rx.poll_recv(cx)) {
            Some(handle) => Poll::Ready(Some(Ok(handle))),
            None => Poll::Ready(this.terminate()),
        }
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("execution", &self.execution)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

/// One result of an execution: its headers, and the records that follow.
pub struct ResultHandle {
    index: usize,
    columns: Arc<ResultColumns>,
    rx: mpsc::Receiver<Record>,
    result: Arc<ResultShared>,
    execution: ExecutionHandle,
}

impl ResultHandle {
    pub(crate) fn new(
        index: usize,
        columns: Arc<ResultColumns>,
        rx: mpsc::Receiver<Record>,
        result: Arc<ResultShared>,
        execution: ExecutionHandle,
    ) -> Self {
        Self {
            index,
            columns,
            rx,
            result,
            execution,
        }
    }

    /// Position of this result in the execution, starting at 0.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn columns(&self) -> &Arc<ResultColumns> {
        &self.columns
    }

    #[must_use]
    pub fn into_records(self) -> RecordStream {
        RecordStream {
            index: self.index,
            columns: self.columns,
            rx: self.rx,
            result: self.result,
            execution: self.execution,
            settle: Settle::default(),
            terminated: false,
        }
    }

    /// Skip this result; its remaining rows are read off the wire and discarded.
    pub fn abandon(self) {
        drop(self);
    }
}

impl std::fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("index", &self.index)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// The records of one result, in server order.
///
/// Ends with `None` when the server finished the result, or with one `Err` if the execution
/// stopped before that.
pub struct RecordStream {
    index: usize,
    columns: Arc<ResultColumns>,
    rx: mpsc::Receiver<Record>,
    result: Arc<ResultShared>,
    execution: ExecutionHandle,
    settle: Settle,
    terminated: bool,
}

impl RecordStream {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn columns(&self) -> &Arc<ResultColumns> {
        &self.columns
    }

    /// Rows affected reported for this result; known once the stream has ended.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.result.rows_affected.get().copied().flatten()
    }

    /// Project every record into `T`.
    pub fn typed<T: DeserializeOwned>(
        self,
        mode: MapMode,
    ) -> impl Stream<Item = Result<T, SqlConduitError>> + Send + Unpin {
        self.map(move |record| record.and_then(|record| map_record(&record, mode)))
    }

    /// Drain the remaining records into memory.
    ///
    /// # Errors
    /// Returns the error that ended the execution before this result finished.
    pub async fn collect_records(mut self) -> Result<Vec<Record>, SqlConduitError> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record?);
        }
        Ok(records)
    }

    /// Every record was received; the result either ended cleanly or the execution stopped
    /// part-way through it.
    fn terminate(&mut self) -> Option<Result<Record, SqlConduitError>> {
        self.terminated = true;
        self.rx.close();
        if self.result.rows_affected.get().is_some() {
            return None;
        }
        Some(Err(self.execution.error().unwrap_or_else(|| {
            SqlConduitError::Faulted("result ended before the server finished it".into())
        })))
    }
}

impl Stream for RecordStream {
    type Item = Result<Record, SqlConduitError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.terminated {
            return Poll::Ready(None);
        }
        if let Some(err) = ready!(this.settle.poll(&this.execution, cx)) {
            this.terminated = true;
            this.rx.close();
            return Poll::Ready(Some(Err(err)));
        }
        match ready!(this.rx.poll_recv(cx)) {
            Some(record) => Poll::Ready(Some(Ok(record))),
            None => Poll::Ready(this.terminate()),
        }
    }
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("index", &self.index)
            .field("columns", &self.columns)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}
