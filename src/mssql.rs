//! SQL Server binding over `tiberius`.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sql_conduit::mssql::MssqlConnector;
//! use sql_conduit::prelude::*;
//!
//! # async fn demo() -> Result<(), SqlConduitError> {
//! let registry = Arc::new(PoolRegistry::new(Arc::new(MssqlConnector::new())));
//! let options = ClientOptions::builder(
//!     "localhost".into(),
//!     "inventory".into(),
//!     "app".into(),
//!     "secret".into(),
//! )
//! .finish()?;
//! let client = SqlClient::new(registry, options)?;
//! let ct = CancellationToken::new();
//! let sets = client
//!     .execute_collected(
//!         Command::text("SELECT TOP 10 sku, qty FROM stock WHERE qty < @P1").bind(5),
//!         &ct,
//!     )
//!     .await?;
//! # let _ = sets;
//! # Ok(())
//! # }
//! ```
//!
//! Every batch is followed by a `@@ROWCOUNT` marker result, and procedure output parameters come
//! back in a trailing marker result; neither is ever visible to callers.

mod batch;
mod connection;
mod connector;
mod values;

pub use connection::MssqlConnection;
pub use connector::MssqlConnector;
