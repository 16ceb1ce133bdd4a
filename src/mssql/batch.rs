use std::borrow::Cow;
use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;
use tiberius::{ColumnData, IntoSql};

use crate::driver::{Command, Param};
use crate::error::SqlConduitError;
use crate::types::{ParamDirection, RowValues, SqlType};

/// First column of the trailing result carrying output parameter values.
pub(crate) const OUTPUT_MARKER: &str = "__conduit_output__";
/// Only column of the result carrying `@@ROWCOUNT` of the caller's last statement.
pub(crate) const ROWCOUNT_MARKER: &str = "__conduit_rowcount__";

const IDENT: &str = r"[A-Za-z_#][A-Za-z0-9_@#$]*";

static PARAM_NAME: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(&format!("^{IDENT}$")));

static OBJECT_NAME: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    let part = format!(r"(?:\[[^\]]+\]|{IDENT})");
    Regex::new(&format!(r"^(?:{part}\.){{0,3}}{part}$"))
});

fn is_match(
    pattern: &LazyLock<Result<Regex, regex::Error>>,
    text: &str,
) -> Result<bool, SqlConduitError> {
    pattern
        .as_ref()
        .map(|re| re.is_match(text))
        .map_err(|e| SqlConduitError::ParameterError(format!("identifier pattern: {e}")))
}

/// A command rendered as one T-SQL batch plus the values bound to its `@Pn` placeholders.
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) sql: String,
    pub(crate) args: Vec<SqlArg>,
}

impl Batch {
    fn bind(&mut self, param: &Param) -> usize {
        self.args.push(SqlArg {
            value: param.value.clone(),
            sql_type: param.sql_type.clone(),
        });
        self.args.len()
    }
}

/// Render `command` for submission.
///
/// Positional parameters of a text batch keep their `@P1..@Pn` ordinals. Named parameters become
/// declared variables initialised from later ordinals, so the caller's SQL can use `@name`.
/// Procedure calls become an `EXEC` with output parameters declared up front and read back in a
/// trailing marker result.
pub(crate) fn render(command: &Command) -> Result<Batch, SqlConduitError> {
    let mut batch = Batch {
        sql: String::new(),
        args: Vec::with_capacity(command.params().len()),
    };
    match command {
        Command::Text { sql, params } => {
            for param in params.iter().filter(|p| p.name.is_none()) {
                batch.bind(param);
            }
            let mut prelude = String::new();
            for param in params.iter().filter(|p| p.name.is_some()) {
                let name = checked_name(param)?;
                let ordinal = batch.bind(param);
                let _ = writeln!(
                    prelude,
                    "DECLARE @{name} {} = @P{ordinal};",
                    param.sql_type.declaration()
                );
            }
            batch.sql = format!("{prelude}{sql}\n;SELECT @@ROWCOUNT AS [{ROWCOUNT_MARKER}];");
        }
        Command::Procedure { name, params } => {
            if !is_match(&OBJECT_NAME, name.trim())? {
                return Err(SqlConduitError::ParameterError(format!(
                    "invalid procedure name {name:?}"
                )));
            }
            let mut prelude = String::new();
            let mut arguments = Vec::with_capacity(params.len());
            let mut outputs = Vec::new();
            for param in params {
                let bare = checked_name(param)?;
                match param.direction {
                    ParamDirection::Input => {
                        let ordinal = batch.bind(param);
                        arguments.push(format!("@{bare} = @P{ordinal}"));
                    }
                    ParamDirection::Output => {
                        let _ = writeln!(
                            prelude,
                            "DECLARE @{bare} {};",
                            param.sql_type.declaration()
                        );
                        arguments.push(format!("@{bare} = @{bare} OUTPUT"));
                        outputs.push(bare);
                    }
                    ParamDirection::InputOutput => {
                        let ordinal = batch.bind(param);
                        let _ = writeln!(
                            prelude,
                            "DECLARE @{bare} {} = @P{ordinal};",
                            param.sql_type.declaration()
                        );
                        arguments.push(format!("@{bare} = @{bare} OUTPUT"));
                        outputs.push(bare);
                    }
                }
            }
            let mut sql = format!("{prelude}EXEC {}", name.trim());
            if !arguments.is_empty() {
                sql.push(' ');
                sql.push_str(&arguments.join(", "));
            }
            let _ = write!(sql, ";\nSELECT @@ROWCOUNT AS [{ROWCOUNT_MARKER}];");
            if !outputs.is_empty() {
                let columns: Vec<String> =
                    outputs.iter().map(|o| format!("@{o} AS [{o}]")).collect();
                let _ = write!(
                    sql,
                    "\nSELECT NULL AS [{OUTPUT_MARKER}], {};",
                    columns.join(", ")
                );
            }
            batch.sql = sql;
        }
    }
    Ok(batch)
}

fn checked_name(param: &Param) -> Result<&str, SqlConduitError> {
    let name = param
        .bare_name()
        .ok_or_else(|| SqlConduitError::ParameterError("parameter has no name".into()))?;
    if is_match(&PARAM_NAME, name)? {
        Ok(name)
    } else {
        Err(SqlConduitError::ParameterError(format!(
            "invalid parameter name {name:?}"
        )))
    }
}

/// A bound value together with the type it is declared as, so NULLs keep their type.
#[derive(Debug, Clone)]
pub(crate) struct SqlArg {
    value: RowValues,
    sql_type: SqlType,
}

impl<'a> IntoSql<'a> for SqlArg {
    fn into_sql(self) -> ColumnData<'a> {
        match self.value {
            RowValues::Int(i) => ColumnData::I64(Some(i)),
            RowValues::Float(f) => ColumnData::F64(Some(f)),
            RowValues::Text(s) => ColumnData::String(Some(Cow::Owned(s))),
            RowValues::Bool(b) => ColumnData::Bit(Some(b)),
            RowValues::Timestamp(dt) => dt.into_sql(),
            RowValues::Date(d) => d.into_sql(),
            RowValues::Time(t) => t.into_sql(),
            RowValues::TimestampTz(dt) => dt.into_sql(),
            RowValues::Guid(g) => ColumnData::Guid(Some(g)),
            RowValues::JSON(json) => ColumnData::String(Some(Cow::Owned(json.to_string()))),
            RowValues::Blob(bytes) => ColumnData::Binary(Some(Cow::Owned(bytes))),
            RowValues::Null => typed_null(&self.sql_type),
        }
    }
}

fn typed_null(sql_type: &SqlType) -> ColumnData<'static> {
    match sql_type {
        SqlType::Int => ColumnData::I64(None),
        SqlType::Float | SqlType::Decimal => ColumnData::F64(None),
        SqlType::Bool => ColumnData::Bit(None),
        SqlType::Timestamp => ColumnData::DateTime2(None),
        SqlType::Date => ColumnData::Date(None),
        SqlType::Time => ColumnData::Time(None),
        SqlType::TimestampTz => ColumnData::DateTimeOffset(None),
        SqlType::Guid => ColumnData::Guid(None),
        SqlType::Binary => ColumnData::Binary(None),
        SqlType::Text | SqlType::Json | SqlType::Other(_) => ColumnData::String(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_batches_keep_ordinals_and_declare_named_params() {
        let command = Command::text("SELECT * FROM t WHERE a = @P1 AND b = @flag")
            .bind(5)
            .param(Param::named("@flag", true));
        let batch = render(&command).expect("render");
        assert_eq!(batch.args.len(), 2);
        assert!(batch.sql.starts_with("DECLARE @flag BIT = @P2;\nSELECT * FROM t"));
        assert!(batch.sql.ends_with(&format!("SELECT @@ROWCOUNT AS [{ROWCOUNT_MARKER}];")));
    }

    #[test]
    fn procedures_declare_outputs_and_read_them_back() {
        let command = Command::procedure("dbo.[Place Order]")
            .param(Param::named("customer", 42))
            .param(Param::output("order_id", SqlType::Int))
            .param(Param::named("note", "rush").in_out());
        let batch = render(&command).expect("render");
        assert_eq!(batch.args.len(), 2);
        assert!(batch.sql.contains("DECLARE @order_id BIGINT;"));
        assert!(batch.sql.contains("DECLARE @note NVARCHAR(MAX) = @P2;"));
        assert!(batch.sql.contains(
            "EXEC dbo.[Place Order] @customer = @P1, @order_id = @order_id OUTPUT, @note = @note OUTPUT;"
        ));
        assert!(batch.sql.ends_with(&format!(
            "SELECT NULL AS [{OUTPUT_MARKER}], @order_id AS [order_id], @note AS [note];"
        )));
    }

    #[test]
    fn hostile_names_are_rejected() {
        let bad_proc = Command::procedure("dbo.p; DROP TABLE x");
        assert!(matches!(
            render(&bad_proc),
            Err(SqlConduitError::ParameterError(_))
        ));

        let bad_param = Command::procedure("dbo.p").param(Param::named("x = 1; --", 1));
        assert!(matches!(
            render(&bad_param),
            Err(SqlConduitError::ParameterError(_))
        ));
    }
}
