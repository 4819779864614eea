use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};

use crate::config::DatabaseConnectionConfig;
use crate::{AppError, AppResult, ErrorKind};

use super::{quote_ident, Connector, RowSink, SqlConnection, SqlValue};

const CONNECTION_CHARSET: &str = "utf8mb4";

/// Opens MySQL/MariaDB connections with `sqlx`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlConnector;

impl Connector for MySqlConnector {
    type Conn = MySqlDatabase;

    async fn connect(&self, config: &DatabaseConnectionConfig) -> AppResult<MySqlDatabase> {
        MySqlDatabase::connect(config).await
    }
}

/// A single live connection. Closing and reopening it is part of the import
/// protocol, so the options are kept alongside.
pub struct MySqlDatabase {
    options: MySqlConnectOptions,
    conn: Option<MySqlConnection>,
}

impl MySqlDatabase {
    pub async fn connect(config: &DatabaseConnectionConfig) -> AppResult<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name)
            .charset(CONNECTION_CHARSET);
        let conn = open(&options).await.map_err(|err| {
            err.with_context("host", config.host.clone())
                .with_context("port", config.port.to_string())
                .with_context("database", config.name.clone())
        })?;
        tracing::info!(
            target: "sitebackup",
            event = "db_connected",
            host = %config.host,
            port = config.port,
            database = %config.name
        );
        Ok(Self {
            options,
            conn: Some(conn),
        })
    }

    fn live(&mut self) -> AppResult<&mut MySqlConnection> {
        self.conn.as_mut().ok_or_else(|| {
            AppError::of(ErrorKind::Connection, "Database connection is closed")
        })
    }
}

async fn open(options: &MySqlConnectOptions) -> AppResult<MySqlConnection> {
    let mut conn = options
        .connect()
        .await
        .map_err(|err| AppError::from(err).reclassify(ErrorKind::Connection, "Unable to connect to the database"))?;
    sqlx::raw_sql("SET time_zone = '+00:00'")
        .execute(&mut conn)
        .await
        .map_err(AppError::from)?;
    Ok(conn)
}

fn text_at(row: &MySqlRow, index: usize) -> AppResult<String> {
    row.try_get_unchecked::<String, _>(index)
        .map_err(AppError::from)
}

fn decode_row(row: &MySqlRow) -> AppResult<Vec<SqlValue>> {
    let mut values = Vec::with_capacity(row.columns().len());
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index).map_err(AppError::from)?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_ascii_uppercase();
        drop(raw);
        let value = if is_numeric(&type_name) {
            SqlValue::Number(text_at(row, index)?)
        } else if is_binary(&type_name) {
            SqlValue::Bytes(
                row.try_get_unchecked::<Vec<u8>, _>(index)
                    .map_err(AppError::from)?,
            )
        } else {
            SqlValue::Text(text_at(row, index)?)
        };
        values.push(value);
    }
    Ok(values)
}

fn is_numeric(type_name: &str) -> bool {
    let base = type_name.split_whitespace().next().unwrap_or_default();
    matches!(
        base,
        "TINYINT"
            | "SMALLINT"
            | "MEDIUMINT"
            | "INT"
            | "INTEGER"
            | "BIGINT"
            | "DECIMAL"
            | "NUMERIC"
            | "FLOAT"
            | "DOUBLE"
            | "REAL"
            | "YEAR"
    )
}

fn is_binary(type_name: &str) -> bool {
    type_name.contains("BLOB")
        || type_name.contains("BINARY")
        || matches!(type_name, "BIT" | "GEOMETRY")
}

impl SqlConnection for MySqlDatabase {
    async fn server_version(&mut self) -> AppResult<String> {
        let conn = self.live()?;
        let row = sqlx::raw_sql("SELECT VERSION()")
            .fetch_one(&mut *conn)
            .await
            .map_err(AppError::from)?;
        text_at(&row, 0)
    }

    async fn list_tables(&mut self) -> AppResult<Vec<String>> {
        let conn = self.live()?;
        let rows = sqlx::raw_sql("SHOW FULL TABLES WHERE Table_type = 'BASE TABLE'")
            .fetch_all(&mut *conn)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "list_tables"))?;
        rows.iter().map(|row| text_at(row, 0)).collect()
    }

    async fn show_create_table(&mut self, table: &str) -> AppResult<String> {
        let conn = self.live()?;
        let sql = format!("SHOW CREATE TABLE {}", quote_ident(table));
        let row = sqlx::raw_sql(&sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "show_create_table")
                    .with_context("table", table.to_string())
            })?;
        text_at(&row, 1)
    }

    async fn stream_rows(&mut self, table: &str, sink: &mut dyn RowSink) -> AppResult<u64> {
        let conn = self.live()?;
        let sql = format!("SELECT * FROM {}", quote_ident(table));
        let mut rows = sqlx::raw_sql(&sql).fetch(&mut *conn);
        let mut count = 0_u64;
        while let Some(row) = rows.try_next().await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "stream_rows")
                .with_context("table", table.to_string())
        })? {
            sink.push_row(decode_row(&row)?)?;
            count += 1;
        }
        Ok(count)
    }

    async fn execute(&mut self, sql: &str) -> AppResult<()> {
        let conn = self.live()?;
        sqlx::raw_sql(sql)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    async fn begin_consistent_read(&mut self) -> AppResult<()> {
        self.execute("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await?;
        self.execute("START TRANSACTION WITH CONSISTENT SNAPSHOT")
            .await
    }

    async fn end_consistent_read(&mut self) -> AppResult<()> {
        self.execute("COMMIT").await
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(AppError::from)?;
            tracing::debug!(target: "sitebackup", event = "db_closed");
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> AppResult<()> {
        self.close().await?;
        self.conn = Some(open(&self.options).await?);
        tracing::debug!(target: "sitebackup", event = "db_reconnected");
        Ok(())
    }
}
