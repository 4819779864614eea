//! Database seam used by the exporter and importer.
//!
//! The engine talks to the database only through [`SqlConnection`], so the
//! dump/replay logic is independent of the driver. The MySQL adapter lives in
//! [`mysql`] behind the `mysql` cargo feature.

use std::fmt::Write as _;

use crate::config::DatabaseConnectionConfig;
use crate::AppResult;

#[cfg(feature = "mysql")]
pub mod mysql;
pub mod statements;

/// Whether a driver for the supported engine was compiled into this build.
pub const fn driver_available() -> bool {
    cfg!(feature = "mysql")
}

/// A single column value as it travels between the database and a dump file.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    /// Numeric value kept in the server's textual rendering so precision is
    /// never lost (DECIMAL, BIGINT UNSIGNED).
    Number(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Renders the value as a MySQL literal.
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Number(raw) => raw.clone(),
            SqlValue::Text(text) => quote_string(text),
            SqlValue::Bytes(bytes) if bytes.is_empty() => "''".to_string(),
            SqlValue::Bytes(bytes) => {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("0x");
                for byte in bytes {
                    let _ = write!(out, "{byte:02X}");
                }
                out
            }
        }
    }
}

/// Quotes an identifier with backticks, doubling embedded backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quotes a string literal using MySQL's escape rules.
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\u{1a}' => out.push_str("\\Z"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Receives rows while a table is being streamed.
pub trait RowSink {
    fn push_row(&mut self, row: Vec<SqlValue>) -> AppResult<()>;
}

/// Operations the backup engine needs from a live database connection.
#[allow(async_fn_in_trait)]
pub trait SqlConnection {
    async fn server_version(&mut self) -> AppResult<String>;

    /// Base tables of the connected schema (views excluded), in server order.
    async fn list_tables(&mut self) -> AppResult<Vec<String>>;

    /// The `CREATE TABLE` statement for `table`, without a trailing `;`.
    async fn show_create_table(&mut self, table: &str) -> AppResult<String>;

    /// Streams every row of `table` into `sink`, returning the row count.
    async fn stream_rows(&mut self, table: &str, sink: &mut dyn RowSink) -> AppResult<u64>;

    async fn execute(&mut self, sql: &str) -> AppResult<()>;

    /// Starts a read view so every table is dumped from the same snapshot.
    async fn begin_consistent_read(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn end_consistent_read(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()>;

    async fn reconnect(&mut self) -> AppResult<()>;
}

/// Opens connections from configuration.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Conn: SqlConnection;

    async fn connect(&self, config: &DatabaseConnectionConfig) -> AppResult<Self::Conn>;
}

/// Connector used when the crate is built without a database driver. Every
/// attempt fails with `DriverMissing`.
#[cfg(not(feature = "mysql"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct MissingDriver;

#[cfg(not(feature = "mysql"))]
impl Connector for MissingDriver {
    type Conn = NoConnection;

    async fn connect(&self, _config: &DatabaseConnectionConfig) -> AppResult<NoConnection> {
        Err(crate::AppError::of(
            crate::ErrorKind::DriverMissing,
            "This build does not include a MySQL driver",
        ))
    }
}

/// Never constructed; exists so [`MissingDriver`] has a connection type.
#[cfg(not(feature = "mysql"))]
pub enum NoConnection {}

#[cfg(not(feature = "mysql"))]
impl SqlConnection for NoConnection {
    async fn server_version(&mut self) -> AppResult<String> {
        match *self {}
    }

    async fn list_tables(&mut self) -> AppResult<Vec<String>> {
        match *self {}
    }

    async fn show_create_table(&mut self, _table: &str) -> AppResult<String> {
        match *self {}
    }

    async fn stream_rows(&mut self, _table: &str, _sink: &mut dyn RowSink) -> AppResult<u64> {
        match *self {}
    }

    async fn execute(&mut self, _sql: &str) -> AppResult<()> {
        match *self {}
    }

    async fn close(&mut self) -> AppResult<()> {
        match *self {}
    }

    async fn reconnect(&mut self) -> AppResult<()> {
        match *self {}
    }
}

/// The connector this build uses by default.
#[cfg(feature = "mysql")]
pub type DefaultConnector = mysql::MySqlConnector;
#[cfg(not(feature = "mysql"))]
pub type DefaultConnector = MissingDriver;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_literals_escape_mysql_specials() {
        assert_eq!(quote_string("O'Brien"), "'O\\'Brien'");
        assert_eq!(quote_string("a\nb\\c"), "'a\\nb\\\\c'");
        assert_eq!(quote_string("say \"hi\""), "'say \\\"hi\\\"'");
        assert_eq!(quote_string("nul\0"), "'nul\\0'");
    }

    #[test]
    fn identifiers_double_backticks() {
        assert_eq!(quote_ident("clientes"), "`clientes`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn values_render_as_literals() {
        assert_eq!(SqlValue::Null.to_literal(), "NULL");
        assert_eq!(SqlValue::Number("12.50".into()).to_literal(), "12.50");
        assert_eq!(SqlValue::Text("ñandú".into()).to_literal(), "'ñandú'");
        assert_eq!(SqlValue::Bytes(vec![0xde, 0xad]).to_literal(), "0xDEAD");
        assert_eq!(SqlValue::Bytes(Vec::new()).to_literal(), "''");
    }
}
