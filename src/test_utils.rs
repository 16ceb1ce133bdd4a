//! Scripted in-process server for exercising the pipeline without a database.
//!
//! ```rust
//! use sql_conduit::prelude::*;
//! use sql_conduit::test_utils::{ScriptedServer, Step};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SqlConduitError> {
//! let server = ScriptedServer::new();
//! server.script("SELECT n FROM numbers", vec![Step::numbers("n", 1..=3)]);
//!
//! let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
//! let ct = CancellationToken::new();
//! let numbers: Vec<i64> = client.execute_single_column("SELECT n FROM numbers", &ct).await?;
//! assert_eq!(numbers, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

mod connection;
mod server;

pub use connection::{ScriptedConnection, ScriptedConnector};
pub use server::{
    BatchRecord, DEFAULT_LANGUAGE, SESSION_PROBE, ScriptedServer, SessionSnapshot, Step,
    script_key,
};

use crate::results::{ColumnHeader, Record, ResultColumns};
use crate::types::RowValues;

/// Build a record from headers and values.
#[must_use]
pub fn create_test_record(headers: Vec<ColumnHeader>, values: Vec<RowValues>) -> Record {
    Record::new(Arc::new(ResultColumns::new(headers)), values)
}
