use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::BoxStream;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::ConnectionIdentity;
use crate::driver::{AbortHandle, Command, DriverConnection, WireEvent};
use crate::error::SqlConduitError;
use crate::types::IsolationLevel;

use super::manager::ConduitManager;

/// One physical connection plus the session bookkeeping the pool needs to hand it out clean.
pub struct PhysicalConnection {
    id: u64,
    identity: ConnectionIdentity,
    driver: Box<dyn DriverConnection>,
    created: Instant,
    last_reset: Option<Instant>,
    transaction_open: bool,
    isolation: IsolationLevel,
    language_changed: bool,
    needs_validation: bool,
    broken: bool,
}

impl PhysicalConnection {
    pub(crate) fn new(
        id: u64,
        identity: ConnectionIdentity,
        driver: Box<dyn DriverConnection>,
    ) -> Self {
        Self {
            id,
            identity,
            driver,
            created: Instant::now(),
            last_reset: None,
            transaction_open: false,
            isolation: IsolationLevel::default(),
            language_changed: false,
            needs_validation: false,
            broken: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// When the session state was last restored to defaults; `None` for a never-used connection.
    #[must_use]
    pub fn last_reset(&self) -> Option<Instant> {
        self.last_reset
    }

    /// A transaction was begun on this session and not yet finished.
    #[must_use]
    pub fn has_dangling_transaction(&self) -> bool {
        self.transaction_open
    }

    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    #[must_use]
    pub fn needs_validation(&self) -> bool {
        self.needs_validation
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// The connection must not go back to the idle set.
    pub fn mark_broken(&mut self) {
        if !self.broken {
            debug!(conn = self.id, "connection marked broken");
        }
        self.broken = true;
    }

    /// The session state is unknown (e.g. after an abort); verify before reuse.
    pub fn mark_needs_validation(&mut self) {
        self.needs_validation = true;
    }

    pub(crate) fn execute<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> BoxStream<'a, Result<WireEvent, SqlConduitError>> {
        self.driver.execute(command)
    }

    pub(crate) fn abort_handle(&self) -> Arc<dyn AbortHandle> {
        self.driver.abort_handle()
    }

    pub(crate) async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), SqlConduitError> {
        let result = self.driver.begin(isolation).await;
        self.note_outcome(&result);
        result?;
        self.transaction_open = true;
        self.isolation = isolation;
        Ok(())
    }

    pub(crate) async fn commit(&mut self) -> Result<(), SqlConduitError> {
        let result = self.driver.commit().await;
        self.note_outcome(&result);
        result?;
        self.transaction_open = false;
        Ok(())
    }

    pub(crate) async fn rollback(&mut self) -> Result<(), SqlConduitError> {
        let result = self.driver.rollback().await;
        self.note_outcome(&result);
        result?;
        self.transaction_open = false;
        Ok(())
    }

    pub(crate) async fn set_language(&mut self, language: &str) -> Result<(), SqlConduitError> {
        self.language_changed = true;
        let result = self.driver.set_language(language).await;
        self.note_outcome(&result);
        result
    }

    pub(crate) async fn ping(&mut self) -> Result<(), SqlConduitError> {
        let result = self.driver.ping().await;
        self.note_outcome(&result);
        result
    }

    pub(crate) async fn close(&mut self) {
        if let Err(err) = self.driver.close().await {
            debug!(conn = self.id, error = %err, "close failed");
        }
        self.broken = true;
    }

    /// Restore the session for the next borrower: validate if an abort left it indeterminate,
    /// roll back any open transaction and reset isolation level and language. Any failure marks
    /// the connection broken so the pool discards it.
    pub(crate) async fn checkin(&mut self) {
        if self.broken {
            return;
        }
        if self.needs_validation {
            if let Err(err) = self.driver.ping().await {
                warn!(conn = self.id, error = %err, "validation after abort failed; discarding");
                self.broken = true;
                return;
            }
            self.needs_validation = false;
        }
        match self.driver.reset().await {
            Ok(()) => {
                if self.transaction_open {
                    debug!(conn = self.id, "rolled back dangling transaction on checkin");
                }
                self.transaction_open = false;
                self.isolation = IsolationLevel::default();
                self.language_changed = false;
                self.last_reset = Some(Instant::now());
                debug!(conn = self.id, "connection reset");
            }
            Err(err) => {
                warn!(conn = self.id, error = %err, "session reset failed; discarding");
                self.broken = true;
            }
        }
    }

    fn note_outcome(&mut self, result: &Result<(), SqlConduitError>) {
        if let Err(err) = result
            && err.is_connection_fatal()
        {
            self.mark_broken();
        }
    }
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("transaction_open", &self.transaction_open)
            .field("isolation", &self.isolation)
            .field("language_changed", &self.language_changed)
            .field("needs_validation", &self.needs_validation)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

enum Slot {
    Pooled(bb8::PooledConnection<'static, ConduitManager>),
    Unpooled(Box<PhysicalConnection>),
}

/// A checked-out connection. Hand it back with [`PooledConnection::release`]; dropping it
/// schedules the same release on the current runtime.
pub struct PooledConnection {
    slot: Option<Slot>,
}

impl PooledConnection {
    pub(crate) fn pooled(conn: bb8::PooledConnection<'static, ConduitManager>) -> Self {
        Self {
            slot: Some(Slot::Pooled(conn)),
        }
    }

    pub(crate) fn unpooled(conn: PhysicalConnection) -> Self {
        Self {
            slot: Some(Slot::Unpooled(Box::new(conn))),
        }
    }

    #[must_use]
    pub fn is_pooled(&self) -> bool {
        matches!(self.slot, Some(Slot::Pooled(_)))
    }

    /// Check the connection back in: reset it for the pool, or close it when pooling is off.
    pub async fn release(mut self) {
        if let Some(slot) = self.slot.take() {
            release_slot(slot).await;
        }
    }
}

async fn release_slot(slot: Slot) {
    match slot {
        Slot::Pooled(mut conn) => {
            conn.checkin().await;
            // bb8 discards it here if `checkin` marked it broken.
            drop(conn);
        }
        Slot::Unpooled(mut conn) => {
            conn.close().await;
            debug!(conn = conn.id(), "unpooled connection closed");
        }
    }
}

impl Deref for PooledConnection {
    type Target = PhysicalConnection;

    fn deref(&self) -> &PhysicalConnection {
        match &self.slot {
            Some(Slot::Pooled(conn)) => &**conn,
            Some(Slot::Unpooled(conn)) => &**conn,
            None => unreachable!("connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut PhysicalConnection {
        match &mut self.slot {
            Some(Slot::Pooled(conn)) => &mut **conn,
            Some(Slot::Unpooled(conn)) => &mut **conn,
            None => unreachable!("connection used after release"),
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.slot {
            Some(_) => f.debug_tuple("PooledConnection").field(&**self).finish(),
            None => f.write_str("PooledConnection(released)"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut slot) = self.slot.take() else {
            return;
        };
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(release_slot(slot));
        } else if let Slot::Pooled(conn) = &mut slot {
            // No runtime to reset on; never hand an unreset session to the next borrower.
            conn.mark_broken();
        }
    }
}
