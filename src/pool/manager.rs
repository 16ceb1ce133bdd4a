use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bb8::ManageConnection;
use tracing::debug;

use crate::config::{ClientOptions, ConnectionIdentity};
use crate::driver::Connector;
use crate::error::SqlConduitError;

use super::connection::PhysicalConnection;

/// bb8 manager opening physical connections for one identity.
pub struct ConduitManager {
    connector: Arc<dyn Connector>,
    identity: ConnectionIdentity,
    options: ClientOptions,
    next_id: Arc<AtomicU64>,
}

impl ConduitManager {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        identity: ConnectionIdentity,
        options: ClientOptions,
        next_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            connector,
            identity,
            options,
            next_id,
        }
    }

    /// Open a physical connection outside any pool.
    pub(crate) async fn open(&self) -> Result<PhysicalConnection, SqlConduitError> {
        open_physical(
            self.connector.as_ref(),
            &self.identity,
            &self.options,
            &self.next_id,
        )
        .await
    }
}

pub(crate) async fn open_physical(
    connector: &dyn Connector,
    identity: &ConnectionIdentity,
    options: &ClientOptions,
    next_id: &AtomicU64,
) -> Result<PhysicalConnection, SqlConduitError> {
    let driver = tokio::time::timeout(options.connect_timeout, connector.connect(identity, options))
        .await
        .map_err(|_| {
            SqlConduitError::ConnectionError(format!(
                "connect to {identity} timed out after {:?}",
                options.connect_timeout
            ))
        })??;
    let id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(conn = id, %identity, "physical connection opened");
    Ok(PhysicalConnection::new(id, identity.clone(), driver))
}

impl ManageConnection for ConduitManager {
    type Connection = PhysicalConnection;
    type Error = SqlConduitError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        async move { self.open().await }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move { conn.ping().await }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_broken()
    }
}
