use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::CancelScope;
use crate::config::ClientOptions;
use crate::convert::from_value;
use crate::driver::Command;
use crate::error::{CancelReason, SqlConduitError};
use crate::executor::{Executor, PinnedSlot, lock_slot};
use crate::mapper::{MapMode, RowMapper, map_record};
use crate::pool::{PoolRegistry, PoolStatus};
use crate::results::{OutputParameters, ResultSet};
use crate::stream::ResultStream;
use crate::types::{ConnectionState, IsolationLevel};

#[derive(Debug)]
struct Session {
    state: ConnectionState,
    /// Cancelled (and replaced) on disconnect, stopping everything started before.
    token: CancellationToken,
    in_transaction: bool,
    language: Option<String>,
}

/// Entry point for applications: one logical client over a shared pool registry.
///
/// Calls made outside a transaction borrow a pooled connection for their own duration. Between
/// [`begin_transaction`](Self::begin_transaction) and commit/rollback, every call runs on the
/// one connection the transaction is pinned to.
pub struct SqlClient {
    registry: Arc<PoolRegistry>,
    options: Arc<ClientOptions>,
    session: Mutex<Session>,
    pinned: PinnedSlot,
}

impl SqlClient {
    /// # Errors
    /// Returns `SqlConduitError::ConfigError` if `options` are inconsistent.
    pub fn new(
        registry: Arc<PoolRegistry>,
        options: ClientOptions,
    ) -> Result<Self, SqlConduitError> {
        options.validate()?;
        Ok(Self {
            registry,
            options: Arc::new(options),
            session: Mutex::new(Session {
                state: ConnectionState::Closed,
                token: CancellationToken::new(),
                in_transaction: false,
                language: None,
            }),
            pinned: Arc::new(Mutex::new(None)),
        })
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.session().state
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.session().in_transaction
    }

    /// Open the client. Verifies the server is reachable by checking a connection out and back
    /// in. Calling it on an open client does nothing.
    ///
    /// # Errors
    /// Returns `ConnectionError`, `PoolExhausted` or `Cancelled`; the client stays closed.
    pub async fn connect(&self, ct: &CancellationToken) -> Result<(), SqlConduitError> {
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        let scope = CancelScope::new();
        scope.link(ct, CancelReason::Caller);
        let acquired = self.registry.acquire(&self.options, &scope).await;
        scope.finish();
        acquired?.release().await;
        self.session().state = ConnectionState::Open;
        debug!(identity = %self.options.identity(), "client connected");
        Ok(())
    }

    /// Close the client. Outstanding executions are cancelled (and aborted on the server) and an
    /// open transaction is rolled back. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let (old_token, had_transaction) = {
            let mut session = self.session();
            session.state = ConnectionState::Closed;
            let had_transaction = std::mem::take(&mut session.in_transaction);
            (
                std::mem::replace(&mut session.token, CancellationToken::new()),
                had_transaction,
            )
        };
        old_token.cancel();
        let pinned = lock_slot(&self.pinned).take();
        if let Some(conn) = pinned {
            // Release rolls the transaction back.
            conn.release().await;
        }
        debug!(had_transaction, "client disconnected");
    }

    /// Begin a transaction; the connection stays pinned to this client until commit/rollback.
    ///
    /// # Errors
    /// Returns `CommandError` if a transaction is already open, or the acquisition/driver error.
    pub async fn begin_transaction(
        &self,
        isolation: IsolationLevel,
        ct: &CancellationToken,
    ) -> Result<(), SqlConduitError> {
        let (token, language) = {
            let session = self.session();
            if session.in_transaction {
                return Err(SqlConduitError::command("a transaction is already open"));
            }
            (session.token.clone(), session.language.clone())
        };
        let scope = CancelScope::new();
        scope.link(ct, CancelReason::Caller);
        scope.link(&token, CancelReason::Disconnected);
        let acquired = self.registry.acquire(&self.options, &scope).await;
        scope.finish();
        let mut conn = acquired?;

        let started = async {
            if let Some(language) = &language {
                conn.set_language(language).await?;
            }
            conn.begin(isolation).await
        }
        .await;
        if let Err(err) = started {
            conn.release().await;
            return Err(err);
        }

        let mut session = self.session();
        if session.token.is_cancelled() || session.in_transaction {
            drop(session);
            // Lost a race with disconnect or another begin; release rolls back.
            tokio::spawn(conn.release());
            return Err(SqlConduitError::Cancelled(CancelReason::Disconnected));
        }
        *lock_slot(&self.pinned) = Some(conn);
        session.in_transaction = true;
        debug!(?isolation, "transaction started");
        Ok(())
    }

    /// # Errors
    /// Returns `CommandError` when no transaction is open, `ConnectionBusy` while a stream is
    /// still running on the transaction, or the driver's error.
    pub async fn commit(&self) -> Result<(), SqlConduitError> {
        let mut conn = self.take_pinned()?;
        let result = conn.commit().await;
        conn.release().await;
        result
    }

    /// # Errors
    /// Same as [`commit`](Self::commit).
    pub async fn rollback(&self) -> Result<(), SqlConduitError> {
        let mut conn = self.take_pinned()?;
        let result = conn.rollback().await;
        conn.release().await;
        result
    }

    /// Set the session language for subsequent calls. Pooled connections get their default
    /// language back when they are checked in.
    ///
    /// # Errors
    /// Returns the driver's error when applying it to an open transaction fails.
    pub async fn set_language(&self, language: &str) -> Result<(), SqlConduitError> {
        let in_transaction = {
            let mut session = self.session();
            session.language = Some(language.to_string());
            session.in_transaction
        };
        if !in_transaction {
            return Ok(());
        }
        let Some(mut conn) = lock_slot(&self.pinned).take() else {
            return Err(SqlConduitError::ConnectionBusy(
                "the transaction's connection is streaming another execution".into(),
            ));
        };
        let result = conn.set_language(language).await;
        *lock_slot(&self.pinned) = Some(conn);
        result
    }

    /// Executor for one call, bound to this client's session, transaction and language.
    #[must_use]
    pub fn executor(&self) -> Executor {
        let session = self.session();
        Executor::new(Arc::clone(&self.registry), Arc::clone(&self.options))
            .with_session(session.token.clone())
            .with_pinned(session.in_transaction.then(|| Arc::clone(&self.pinned)))
            .with_language(session.language.clone())
    }

    /// # Errors
    /// See [`Executor::execute_non_query`].
    pub async fn execute_non_query(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<u64, SqlConduitError> {
        self.executor().execute_non_query(command, ct).await
    }

    /// # Errors
    /// See [`Executor::execute_collected`].
    pub async fn execute_collected(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<Vec<ResultSet>, SqlConduitError> {
        self.executor().execute_collected(command, ct).await
    }

    /// # Errors
    /// See [`Executor::execute_collected_with_outputs`].
    pub async fn execute_collected_with_outputs(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<(Vec<ResultSet>, OutputParameters), SqlConduitError> {
        self.executor()
            .execute_collected_with_outputs(command, ct)
            .await
    }

    /// # Errors
    /// See [`Executor::execute_streaming`].
    pub async fn execute_streaming(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<ResultStream, SqlConduitError> {
        self.executor().execute_streaming(command, ct).await
    }

    /// Run `command` and map every record of its first result into `T`.
    ///
    /// # Errors
    /// Returns the execution's error, or `MappingError` for the first record that does not fit.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
        mode: MapMode,
    ) -> Result<Vec<T>, SqlConduitError> {
        let sets = self.execute_collected(command, ct).await?;
        sets.into_iter()
            .next()
            .map(|set| set.rows.iter().map(|r| map_record(r, mode)).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Run `command` and map every record of its first result with `mapper`.
    ///
    /// # Errors
    /// Returns the execution's error, the mapper's error, or `Cancelled` if `ct` fires while
    /// mapping.
    pub async fn query_with<T, M>(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
        mapper: &M,
    ) -> Result<Vec<T>, SqlConduitError>
    where
        M: RowMapper<T> + ?Sized,
    {
        let sets = self.execute_collected(command, ct).await?;
        let Some(set) = sets.into_iter().next() else {
            return Ok(Vec::new());
        };
        let mut mapped = Vec::with_capacity(set.len());
        for record in &set.rows {
            if ct.is_cancelled() {
                return Err(SqlConduitError::Cancelled(CancelReason::Caller));
            }
            mapped.push(mapper.map_row(record, set.columns(), ct).await?);
        }
        Ok(mapped)
    }

    /// First column of every record of the first result.
    ///
    /// # Errors
    /// Returns the execution's error, or `MappingError` when a value does not fit `T`.
    pub async fn execute_single_column<T: DeserializeOwned>(
        &self,
        command: impl Into<Command>,
        ct: &CancellationToken,
    ) -> Result<Vec<T>, SqlConduitError> {
        let sets = self.execute_collected(command, ct).await?;
        let Some(set) = sets.into_iter().next() else {
            return Ok(Vec::new());
        };
        set.rows
            .iter()
            .map(|record| {
                let value = record.get_by_index(0).ok_or_else(|| {
                    SqlConduitError::MappingError("result has no columns".into())
                })?;
                from_value(value)
            })
            .collect()
    }

    /// A closed client for the same server, sharing this client's pool registry, with the
    /// database and/or credentials replaced.
    #[must_use]
    pub fn clone_with(
        &self,
        database: Option<&str>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> SqlClient {
        let mut options = (*self.options).clone();
        if let Some(database) = database {
            options.database = database.to_string();
        }
        if let Some(user) = user {
            options.user = user.to_string();
        }
        if let Some(password) = password {
            options.password = password.to_string();
        }
        SqlClient {
            registry: Arc::clone(&self.registry),
            options: Arc::new(options),
            session: Mutex::new(Session {
                state: ConnectionState::Closed,
                token: CancellationToken::new(),
                in_transaction: false,
                language: None,
            }),
            pinned: Arc::new(Mutex::new(None)),
        }
    }

    /// Status of the pool serving this client's identity, once it exists.
    pub async fn pool_status(&self) -> Option<PoolStatus> {
        self.registry.status(&self.options.identity()).await
    }

    fn take_pinned(&self) -> Result<crate::pool::PooledConnection, SqlConduitError> {
        let mut session = self.session();
        if !session.in_transaction {
            return Err(SqlConduitError::command("no transaction is open"));
        }
        let conn = lock_slot(&self.pinned).take().ok_or_else(|| {
            SqlConduitError::ConnectionBusy(
                "the transaction's connection is streaming another execution".into(),
            )
        })?;
        session.in_transaction = false;
        Ok(conn)
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SqlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlClient")
            .field("options", &self.options)
            .field("session", &*self.session())
            .finish_non_exhaustive()
    }
}
