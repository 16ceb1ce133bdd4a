use std::borrow::Cow;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::CancelScope;
use crate::config::ClientOptions;
use crate::driver::Command;
use crate::error::{CancelReason, SqlConduitError};
use crate::pool::{PoolRegistry, PooledConnection};
use crate::results::{OutputParameters, ResultSet};
use crate::stream::{self, ResultStream};
use crate::translation::translate_placeholders;

/// Slot holding the connection a client keeps for an open transaction.
pub(crate) type PinnedSlot = Arc<Mutex<Option<PooledConnection>>>;

pub(crate) fn lock_slot(
    slot: &PinnedSlot,
) -> std::sync::MutexGuard<'_, Option<PooledConnection>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transaction slot a pinned connection returns to, and the session that owns it.
struct Home {
    slot: PinnedSlot,
    /// Cancelled once the owning client disconnected and gave up its transaction.
    session: CancellationToken,
}

/// A connection lent to one execution, and where it goes afterwards.
pub(crate) struct Lease {
    conn: PooledConnection,
    home: Option<Home>,
}

impl Lease {
    /// Hand the connection back: to the transaction slot it came from while the owner still
    /// holds the transaction, else to the pool (which rolls back whatever is open).
    pub(crate) async fn finish(self) {
        let conn = match self.home {
            Some(home) => {
                // Checked under the slot lock: disconnect cancels first, then empties the slot.
                let mut slot = lock_slot(&home.slot);
                if !home.session.is_cancelled() {
                    *slot = Some(self.conn);
                    return;
                }
                drop(slot);
                debug!("transaction owner disconnected; returning its connection to the pool");
                self.conn
            }
            None => self.conn,
        };
        conn.release().await;
    }
}

impl Deref for Lease {
    type Target = PooledConnection;

    fn deref(&self) -> &PooledConnection {
        &self.conn
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut PooledConnection {
        &mut self.conn
    }
}

/// Runs commands against pooled connections.
///
/// Every call takes a `CancellationToken`; the token, the owning client's session and the
/// command timeout together govern acquisition, execution and streaming.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<PoolRegistry>,
    options: Arc<ClientOptions>,
    session: CancellationToken,
    pinned: Option<PinnedSlot>,
    language: Option<String>,
}

impl Executor {
    #[must_use]
    pub fn new(registry: Arc<PoolRegistry>, options: Arc<ClientOptions>) -> Self {
        Self {
            registry,
            options,
            session: CancellationToken::new(),
            pinned: None,
            language: None,
        }
    }

    pub(crate) fn with_session(mut self, session: CancellationToken) -> Self {
        self.session = session;
        self
    }

    pub(crate) fn with_pinned(mut self, pinned: Option<PinnedSlot>) -> Self {
        self.pinned = pinned;
        self
    }

    pub(crate) fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Start `command` and return its result stream as soon as the pipeline is wired.
    ///
    /// The caller consumes results while the server is still producing them; the connection is
    /// held until the stream ends, is cancelled, or is dropped.
    ///
    /// # Errors
    /// Fails before anything is submitted with `ParameterError`, `PoolExhausted`,
    /// `ConnectionError` or `Cancelled`. Later failures surface through the stream.
    pub async fn execute_streaming(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<ResultStream, SqlConduitError> {
        let command = self.prepare(command.into())?;
        let scope = CancelScope::new();
        scope.link(ct, CancelReason::Caller);
        scope.link(&self.session, CancelReason::Disconnected);
        scope.arm_timeout(self.options.command_timeout);

        match self.lease(&scope).await {
            Ok(lease) => Ok(stream::spawn(lease, command, scope, &self.options)),
            Err(err) => {
                scope.finish();
                Err(err)
            }
        }
    }

    /// Run `command` to completion and materialize every result.
    ///
    /// # Errors
    /// Returns the first error of the execution; partial results are discarded.
    pub async fn execute_collected(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<Vec<ResultSet>, SqlConduitError> {
        self.execute_streaming(command, ct).await?.collect_all().await
    }

    /// # Errors
    /// Returns the first error of the execution.
    pub async fn execute_collected_with_outputs(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<(Vec<ResultSet>, OutputParameters), SqlConduitError> {
        self.execute_streaming(command, ct)
            .await?
            .collect_with_outputs()
            .await
    }

    /// Run `command` for its side effects and return the rows affected.
    ///
    /// # Errors
    /// Returns the first error of the execution.
    pub async fn execute_non_query(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<u64, SqlConduitError> {
        let stream = self.execute_streaming(command, ct).await?;
        let execution = stream.execution().clone();
        stream.collect_all().await?;
        Ok(execution.rows_affected().unwrap_or(0))
    }

    fn prepare(&self, mut command: Command) -> Result<Command, SqlConduitError> {
        command.validate()?;
        if self.options.translate_placeholders
            && let Command::Text { sql, .. } = &mut command
            && let Cow::Owned(translated) = translate_placeholders(sql, true)
        {
            *sql = translated;
        }
        Ok(command)
    }

    async fn lease(&self, scope: &CancelScope) -> Result<Lease, SqlConduitError> {
        if let Some(slot) = &self.pinned {
            let conn = lock_slot(slot).take().ok_or_else(|| {
                SqlConduitError::ConnectionBusy(
                    "the transaction's connection is streaming another execution".into(),
                )
            })?;
            return Ok(Lease {
                conn,
                home: Some(Home {
                    slot: Arc::clone(slot),
                    session: self.session.clone(),
                }),
            });
        }

        let mut conn = self.registry.acquire(&self.options, scope).await?;
        if let Some(language) = &self.language
            && let Err(err) = conn.set_language(language).await
        {
            conn.release().await;
            return Err(err);
        }
        Ok(Lease { conn, home: None })
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("options", &self.options)
            .field("pinned", &self.pinned.is_some())
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}
