//! Streaming, cancellation-aware SQL client layer.
//!
//! Results arrive as a stream of result handles, each with its own stream of records, while the
//! server is still producing them. Cancelling, timing out, disconnecting or simply dropping the
//! stream stops the batch on the server, and every pooled connection is reset before anyone else
//! gets it.
//!
//! ```rust
//! use futures_util::StreamExt;
//! use sql_conduit::prelude::*;
//! use sql_conduit::test_utils::{ScriptedServer, Step};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SqlConduitError> {
//! let server = ScriptedServer::new();
//! server.script(
//!     "SELECT id FROM a; SELECT id FROM b",
//!     vec![Step::numbers("id", 1..=2), Step::numbers("id", 10..=12)],
//! );
//! let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
//! let ct = CancellationToken::new();
//!
//! let mut results = client
//!     .execute_streaming("SELECT id FROM a; SELECT id FROM b", &ct)
//!     .await?;
//! let mut counts = Vec::new();
//! while let Some(result) = results.next().await {
//!     let mut records = result?.into_records();
//!     let mut n = 0;
//!     while let Some(record) = records.next().await {
//!         record?;
//!         n += 1;
//!     }
//!     counts.push(n);
//! }
//! assert_eq!(counts, vec![2, 3]);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod convert;
pub mod driver;
pub mod error;
pub mod executor;
pub mod mapper;
pub mod pool;
pub mod prelude;
pub mod results;
pub mod stream;
pub mod translation;
pub mod types;

#[cfg(feature = "mssql")]
pub mod mssql;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use client::SqlClient;
pub use error::{CancelReason, SqlConduitError};
pub use types::RowValues;
