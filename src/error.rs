use std::fmt;

use thiserror::Error;

/// Why an execution stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The caller fired the cancellation token.
    Caller,
    /// The command timeout elapsed.
    Timeout,
    /// The owning client disconnected while work was outstanding.
    Disconnected,
    /// The result stream was dropped before the execution finished.
    Disposed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CancelReason::Caller => "cancelled by caller",
            CancelReason::Timeout => "command timeout elapsed",
            CancelReason::Disconnected => "client disconnected",
            CancelReason::Disposed => "result stream dropped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error)]
pub enum SqlConduitError {
    /// Transport-level failure; the physical connection must be discarded.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// No connection became available within the acquire timeout.
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    /// The server rejected the statement. The connection stays reusable.
    #[error("Command error: {message}")]
    CommandError {
        number: Option<i32>,
        message: String,
    },

    #[error("Mapping error: {0}")]
    MappingError(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// Unexpected protocol failure in the middle of a stream.
    #[error("Execution faulted: {0}")]
    Faulted(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parameter error: {0}")]
    ParameterError(String),

    /// The client's pinned connection is lent to another execution.
    #[error("Connection busy: {0}")]
    ConnectionBusy(String),
}

impl SqlConduitError {
    pub(crate) fn command(message: impl Into<String>) -> Self {
        SqlConduitError::CommandError {
            number: None,
            message: message.into(),
        }
    }

    /// True when the physical connection that produced this error can no longer be trusted.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SqlConduitError::ConnectionError(_) | SqlConduitError::Faulted(_)
        )
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SqlConduitError::Cancelled(_))
    }

    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            SqlConduitError::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(feature = "mssql")]
impl From<tiberius::error::Error> for SqlConduitError {
    fn from(err: tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Server(token) => SqlConduitError::CommandError {
                number: i32::try_from(token.code()).ok(),
                message: token.message().to_string(),
            },
            other => SqlConduitError::ConnectionError(format!("SQL Server error: {other}")),
        }
    }
}

impl From<bb8::RunError<SqlConduitError>> for SqlConduitError {
    fn from(err: bb8::RunError<SqlConduitError>) -> Self {
        match err {
            bb8::RunError::User(inner) => inner,
            bb8::RunError::TimedOut => {
                SqlConduitError::PoolExhausted("timed out waiting for a pooled connection".into())
            }
        }
    }
}

impl From<serde_json::Error> for SqlConduitError {
    fn from(err: serde_json::Error) -> Self {
        SqlConduitError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_leave_connection_usable() {
        let err = SqlConduitError::command("Invalid object name 'nope'");
        assert!(!err.is_connection_fatal());
        assert_eq!(err.to_string(), "Command error: Invalid object name 'nope'");

        let numbered = SqlConduitError::CommandError {
            number: Some(208),
            message: "Invalid object name 'nope'".into(),
        };
        assert!(!numbered.is_connection_fatal());
        assert!(!numbered.is_cancelled());
    }

    #[test]
    fn pool_timeout_maps_to_exhausted() {
        let err: SqlConduitError = bb8::RunError::<SqlConduitError>::TimedOut.into();
        assert!(matches!(err, SqlConduitError::PoolExhausted(_)));
        assert!(SqlConduitError::ConnectionError("reset".into()).is_connection_fatal());
        assert_eq!(
            SqlConduitError::Cancelled(CancelReason::Timeout).cancel_reason(),
            Some(CancelReason::Timeout)
        );
    }
}
