//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and functions
//! to make it easier to get started with the library.

pub use tokio_util::sync::CancellationToken;

pub use crate::client::SqlClient;
pub use crate::config::{ClientOptions, ClientOptionsBuilder, ConnectionIdentity};
pub use crate::convert::from_value;
pub use crate::driver::{Command, Connector, Param};
pub use crate::error::{CancelReason, SqlConduitError};
pub use crate::executor::Executor;
pub use crate::mapper::{FnMapper, MapMode, RowMapper, map_record};
pub use crate::pool::{PoolRegistry, PoolStatus};
pub use crate::results::{ColumnHeader, OutputParameters, Record, ResultColumns, ResultSet};
pub use crate::stream::{
    ExecutionHandle, ExecutionState, RecordStream, ResultHandle, ResultStream,
};
pub use crate::translation::translate_placeholders;
pub use crate::types::{
    ConnectionState, IsolationLevel, ParamDirection, RowValues, SqlType,
};

#[cfg(feature = "mssql")]
pub use crate::mssql::MssqlConnector;
