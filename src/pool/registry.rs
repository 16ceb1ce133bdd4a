use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use bb8::Pool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cancel::CancelScope;
use crate::config::{ClientOptions, ConnectionIdentity};
use crate::driver::Connector;
use crate::error::SqlConduitError;

use super::connection::PooledConnection;
use super::manager::{ConduitManager, open_physical};

/// Point-in-time view of one identity's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Physical connections currently open, idle or checked out.
    pub connections: u32,
    pub idle: u32,
}

impl PoolStatus {
    #[must_use]
    pub fn in_use(&self) -> u32 {
        self.connections.saturating_sub(self.idle)
    }
}

/// All pools of a process, keyed by connection identity.
///
/// Owned explicitly and shared by reference (`Arc`) between clients; there is no global pool
/// state, so separate registries never see each other's connections.
pub struct PoolRegistry {
    connector: Arc<dyn Connector>,
    pools: Mutex<HashMap<ConnectionIdentity, Pool<ConduitManager>>>,
    next_id: Arc<AtomicU64>,
}

impl PoolRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            pools: Mutex::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check out a connection for `options`' identity.
    ///
    /// Waits at most `options.connect_timeout` for capacity and gives up early when `scope`
    /// is cancelled. With pooling disabled a fresh physical connection is opened instead.
    ///
    /// # Errors
    /// Returns `PoolExhausted` on timeout, `Cancelled` when the scope fires, or the connector's
    /// own `ConnectionError`.
    pub async fn acquire(
        &self,
        options: &ClientOptions,
        scope: &CancelScope,
    ) -> Result<PooledConnection, SqlConduitError> {
        if scope.is_cancelled() {
            return Err(scope.error());
        }
        let identity = options.identity();
        let checkout = async {
            if options.pooling {
                let pool = self.pool_for(&identity, options).await?;
                Self::checkout(&pool, &identity, options.connect_timeout).await
            } else {
                let conn = open_physical(
                    self.connector.as_ref(),
                    &identity,
                    options,
                    &self.next_id,
                )
                .await?;
                Ok(PooledConnection::unpooled(conn))
            }
        };
        tokio::select! {
            biased;
            reason = scope.cancelled() => {
                debug!(%identity, %reason, "acquire cancelled");
                Err(SqlConduitError::Cancelled(reason))
            }
            conn = checkout => conn,
        }
    }

    async fn checkout(
        pool: &Pool<ConduitManager>,
        identity: &ConnectionIdentity,
        timeout: Duration,
    ) -> Result<PooledConnection, SqlConduitError> {
        match tokio::time::timeout(timeout, pool.get_owned()).await {
            Ok(Ok(conn)) => Ok(PooledConnection::pooled(conn)),
            Ok(Err(err)) => {
                let err = SqlConduitError::from(err);
                if matches!(err, SqlConduitError::PoolExhausted(_)) {
                    warn!(%identity, ?timeout, "timed out waiting for a pooled connection");
                }
                Err(err)
            }
            Err(_) => {
                warn!(%identity, ?timeout, "timed out waiting for a pooled connection");
                Err(SqlConduitError::PoolExhausted(format!(
                    "no connection to {identity} available within {timeout:?}"
                )))
            }
        }
    }

    async fn pool_for(
        &self,
        identity: &ConnectionIdentity,
        options: &ClientOptions,
    ) -> Result<Pool<ConduitManager>, SqlConduitError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(identity) {
            return Ok(pool.clone());
        }
        let manager = ConduitManager::new(
            Arc::clone(&self.connector),
            identity.clone(),
            options.clone(),
            Arc::clone(&self.next_id),
        );
        let min_idle = (options.min_pool_size > 0).then_some(options.min_pool_size);
        let pool = Pool::builder()
            .max_size(options.max_pool_size)
            .min_idle(min_idle)
            .connection_timeout(options.connect_timeout)
            .test_on_check_out(true)
            .build(manager)
            .await?;
        debug!(
            %identity,
            min = options.min_pool_size,
            max = options.max_pool_size,
            "pool created"
        );
        pools.insert(identity.clone(), pool.clone());
        Ok(pool)
    }

    /// Status of the pool for `identity`, if one has been created.
    pub async fn status(&self, identity: &ConnectionIdentity) -> Option<PoolStatus> {
        let pools = self.pools.lock().await;
        pools.get(identity).map(|pool| {
            let state = pool.state();
            PoolStatus {
                connections: state.connections,
                idle: state.idle_connections,
            }
        })
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry").finish_non_exhaustive()
    }
}
