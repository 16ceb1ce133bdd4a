//! The seam between the execution pipeline and a concrete wire protocol.
//!
//! A binding supplies a [`Connector`] that opens [`DriverConnection`]s. Each connection streams
//! [`WireEvent`]s for a submitted [`Command`] and hands out an [`AbortHandle`] that can stop the
//! running batch out of band, while the event stream itself is still borrowed by the reader.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::{ClientOptions, ConnectionIdentity};
use crate::error::SqlConduitError;
use crate::results::ColumnHeader;
use crate::types::{IsolationLevel, ParamDirection, RowValues, SqlType};

/// A typed, nullable parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Option<String>,
    pub value: RowValues,
    pub sql_type: SqlType,
    pub direction: ParamDirection,
}

impl Param {
    /// Positional input parameter typed after its value.
    pub fn positional(value: impl Into<RowValues>) -> Self {
        let value = value.into();
        Self {
            name: None,
            sql_type: value.natural_type(),
            value,
            direction: ParamDirection::Input,
        }
    }

    /// Named input parameter typed after its value.
    pub fn named(name: impl Into<String>, value: impl Into<RowValues>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::positional(value)
        }
    }

    /// NULL with an explicit declared type.
    pub fn typed_null(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: Some(name.into()),
            value: RowValues::Null,
            sql_type,
            direction: ParamDirection::Input,
        }
    }

    /// Output-only parameter; its value is read back after completion.
    pub fn output(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            direction: ParamDirection::Output,
            ..Self::typed_null(name, sql_type)
        }
    }

    #[must_use]
    pub fn with_type(mut self, sql_type: SqlType) -> Self {
        self.sql_type = sql_type;
        self
    }

    #[must_use]
    pub fn in_out(mut self) -> Self {
        self.direction = ParamDirection::InputOutput;
        self
    }

    /// Parameter name without a leading `@`.
    #[must_use]
    pub fn bare_name(&self) -> Option<&str> {
        self.name.as_deref().map(|n| n.trim_start_matches('@'))
    }
}

/// What gets submitted to the server: a SQL batch or a stored procedure call.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Text { sql: String, params: Vec<Param> },
    Procedure { name: String, params: Vec<Param> },
}

impl Command {
    pub fn text(sql: impl Into<String>) -> Self {
        Command::Text {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn procedure(name: impl Into<String>) -> Self {
        Command::Procedure {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a positional parameter.
    #[must_use]
    pub fn bind(self, value: impl Into<RowValues>) -> Self {
        self.param(Param::positional(value))
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        match &mut self {
            Command::Text { params, .. } | Command::Procedure { params, .. } => params.push(param),
        }
        self
    }

    #[must_use]
    pub fn params(&self) -> &[Param] {
        match self {
            Command::Text { params, .. } | Command::Procedure { params, .. } => params,
        }
    }

    #[must_use]
    pub fn has_outputs(&self) -> bool {
        self.params().iter().any(|p| p.direction.is_output())
    }

    /// Short label used in logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Command::Text { sql, .. } => {
                let first_line = sql.lines().next().unwrap_or_default();
                if first_line.len() > 60 {
                    let mut cut = 60;
                    while !first_line.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    format!("{}...", &first_line[..cut])
                } else {
                    first_line.to_string()
                }
            }
            Command::Procedure { name, .. } => format!("EXEC {name}"),
        }
    }

    /// Check parameter shapes before anything reaches the server.
    ///
    /// # Errors
    /// Returns `SqlConduitError::ParameterError` for output parameters on a text batch or
    /// unnamed procedure parameters.
    pub fn validate(&self) -> Result<(), SqlConduitError> {
        match self {
            Command::Text { params, .. } => {
                if params.iter().any(|p| p.direction.is_output()) {
                    return Err(SqlConduitError::ParameterError(
                        "output parameters are only supported on procedure calls".into(),
                    ));
                }
            }
            Command::Procedure { name, params } => {
                if name.trim().is_empty() {
                    return Err(SqlConduitError::ParameterError(
                        "procedure name is empty".into(),
                    ));
                }
                if let Some(p) = params.iter().find(|p| p.name.is_none()) {
                    return Err(SqlConduitError::ParameterError(format!(
                        "procedure parameters must be named (got positional {:?})",
                        p.value
                    )));
                }
            }
        }
        Ok(())
    }
}

impl From<&str> for Command {
    fn from(sql: &str) -> Self {
        Command::text(sql)
    }
}

impl From<String> for Command {
    fn from(sql: String) -> Self {
        Command::text(sql)
    }
}

/// Unit of progress read off the wire for one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    /// A new result begins; rows that follow belong to it.
    Header(Vec<ColumnHeader>),
    Row(Vec<RowValues>),
    /// The current result has no more rows.
    ResultEnd { rows_affected: Option<u64> },
    /// Informational message the server flushed between statements.
    Progress(String),
    /// Output parameter values; only sent after the last statement ran.
    Output(Vec<(String, RowValues)>),
    /// The whole batch finished.
    Done { rows_affected: u64 },
}

/// Out-of-band "stop what you're running" signal for one physical session.
#[async_trait]
pub trait AbortHandle: Send + Sync {
    /// Ask the server to stop the batch currently executing on the session.
    ///
    /// # Errors
    /// Returns an error if the signal could not be delivered.
    async fn abort(&self) -> Result<(), SqlConduitError>;
}

/// One physical connection as seen by the pool and the pipeline.
#[async_trait]
pub trait DriverConnection: Send {
    /// Submit `command` and stream its events. Nothing is sent until the stream is first polled.
    fn execute<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> BoxStream<'a, Result<WireEvent, SqlConduitError>>;

    /// Handle usable while the stream returned by `execute` is alive.
    fn abort_handle(&self) -> Arc<dyn AbortHandle>;

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), SqlConduitError>;

    async fn commit(&mut self) -> Result<(), SqlConduitError>;

    async fn rollback(&mut self) -> Result<(), SqlConduitError>;

    /// Set the session language (affects server-side message and date formatting).
    async fn set_language(&mut self, language: &str) -> Result<(), SqlConduitError>;

    /// Roll back any open transaction and restore default session settings.
    async fn reset(&mut self) -> Result<(), SqlConduitError>;

    /// Cheap liveness round trip.
    async fn ping(&mut self) -> Result<(), SqlConduitError>;

    /// Close the physical connection. The connection is not used again afterwards.
    async fn close(&mut self) -> Result<(), SqlConduitError>;
}

/// Opens physical connections for an identity.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
        options: &ClientOptions,
    ) -> Result<Box<dyn DriverConnection>, SqlConduitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procedure_params_must_be_named() {
        let ok = Command::procedure("dbo.GetOrders")
            .param(Param::named("@CustomerId", 42_i64))
            .param(Param::output("@Total", SqlType::Int));
        assert!(ok.validate().is_ok());
        assert!(ok.has_outputs());

        let bad = Command::procedure("dbo.GetOrders").bind(42_i64);
        assert!(matches!(
            bad.validate(),
            Err(SqlConduitError::ParameterError(_))
        ));

        let text_out = Command::text("SELECT 1").param(Param::output("x", SqlType::Int));
        assert!(text_out.validate().is_err());
    }

    #[test]
    fn describe_truncates_long_batches() {
        let long = format!("SELECT {}", "x, ".repeat(40));
        let label = Command::text(long).describe();
        assert!(label.ends_with("..."));
        assert_eq!(Command::procedure("dbo.p").describe(), "EXEC dbo.p");
        assert_eq!(Param::named("@a", 1_i64).bare_name(), Some("a"));
    }
}
