//! Connection pooling keyed by [`ConnectionIdentity`](crate::config::ConnectionIdentity).
//!
//! Every checkout is handed back through [`PooledConnection::release`], which restores the
//! session (rollback, default isolation level and language) before the connection becomes idle
//! again. Connections that fail that reset, or that were aborted and fail validation, are
//! discarded instead.

mod connection;
mod manager;
mod registry;

pub use connection::{PhysicalConnection, PooledConnection};
pub use manager::ConduitManager;
pub use registry::{PoolRegistry, PoolStatus};
