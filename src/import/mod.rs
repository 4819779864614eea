//! Validating importer for SQL dumps.
//!
//! [`prepare`] does everything that can fail without touching the database:
//! it checks the source, inflates or repairs it and runs the charset gate.
//! [`replace_database`] then drops every table and replays the dump. The
//! replace is not transactional; a failure part way leaves the schema in
//! whatever state the executed statements produced.

pub mod charset;
pub mod normalize;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::statements::StatementSplitter;
use crate::db::{quote_ident, SqlConnection};
use crate::{AppError, AppResult, ErrorKind};

pub use charset::{detect_charset, normalize_charset, verify_charset, CHARSET_SCAN_LINES};
pub use normalize::{is_gzip, normalize, NormalizedDump};

const STATEMENT_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub source: PathBuf,
    pub was_compressed: bool,
    pub charset: Option<String>,
    pub dropped_tables: Vec<String>,
    pub statements: u64,
}

/// A dump that passed every pre-database check.
#[derive(Debug)]
pub struct PreparedDump {
    pub source: PathBuf,
    pub charset: Option<String>,
    dump: NormalizedDump,
}

impl PreparedDump {
    /// The normalized plain-text file that will be replayed.
    pub fn path(&self) -> &Path {
        self.dump.path()
    }

    pub fn was_compressed(&self) -> bool {
        self.dump.was_compressed
    }
}

pub fn prepare(source: &Path, workdir: &Path, expected_charset: &str) -> AppResult<PreparedDump> {
    if !source.is_file() {
        return Err(
            AppError::of(ErrorKind::FileNotFound, "The dump file does not exist")
                .with_context("file", source.display().to_string()),
        );
    }
    std::fs::create_dir_all(workdir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_import_workdir")
            .with_context("path", workdir.display().to_string())
    })?;

    let dump = normalize(source, workdir)?;
    let charset = detect_charset(dump.path())?;
    verify_charset(charset.as_deref(), expected_charset)
        .map_err(|err| err.with_context("file", source.display().to_string()))?;

    info!(
        target: "sitebackup",
        event = "import_prepared",
        source = %source.display(),
        charset = charset.as_deref().unwrap_or("undeclared"),
        compressed = dump.was_compressed
    );
    Ok(PreparedDump {
        source: source.to_path_buf(),
        charset,
        dump,
    })
}

/// Tables removed and statements executed by [`replace_database`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub dropped_tables: Vec<String>,
    pub statements: u64,
}

/// Drops every table, cycles the connection and replays `dump`.
pub async fn replace_database<C: SqlConnection>(
    conn: &mut C,
    dump: &Path,
) -> AppResult<ReplaceSummary> {
    let started = Instant::now();

    conn.execute("SET FOREIGN_KEY_CHECKS=0")
        .await
        .map_err(|err| exec_error(err, "disable_foreign_keys"))?;
    let tables = conn
        .list_tables()
        .await
        .map_err(|err| exec_error(err, "list_tables"))?;
    for table in &tables {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .await
            .map_err(|err| exec_error(err, "drop_table").with_context("table", table.clone()))?;
    }
    info!(target: "sitebackup", event = "import_tables_dropped", tables = tables.len());

    conn.close().await?;
    conn.reconnect().await?;
    conn.execute("SET FOREIGN_KEY_CHECKS=0")
        .await
        .map_err(|err| exec_error(err, "disable_foreign_keys"))?;

    let statements = replay(conn, dump).await?;

    conn.execute("SET FOREIGN_KEY_CHECKS=1")
        .await
        .map_err(|err| exec_error(err, "enable_foreign_keys"))?;

    info!(
        target: "sitebackup",
        event = "import_replayed",
        statements,
        dropped = tables.len(),
        ms = started.elapsed().as_millis() as u64
    );
    Ok(ReplaceSummary {
        dropped_tables: tables,
        statements,
    })
}

async fn replay<C: SqlConnection>(conn: &mut C, dump: &Path) -> AppResult<u64> {
    let file = File::open(dump).map_err(|err| {
        exec_error(err.into(), "open_normalized_dump")
            .with_context("path", dump.display().to_string())
    })?;
    let mut splitter = StatementSplitter::new();
    let mut executed = 0_u64;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| {
            exec_error(err.into(), "read_dump").with_context("line", (index + 1).to_string())
        })?;
        for statement in splitter.push_line(&line) {
            executed += 1;
            run_statement(conn, &statement, executed).await?;
        }
    }

    let tail = splitter.finish().map_err(|err| {
        AppError::of(ErrorKind::ImportExec, err.to_string())
            .with_context("statement_index", (executed + 1).to_string())
    })?;
    if let Some(statement) = tail {
        executed += 1;
        run_statement(conn, &statement, executed).await?;
    }
    Ok(executed)
}

async fn run_statement<C: SqlConnection>(
    conn: &mut C,
    statement: &str,
    index: u64,
) -> AppResult<()> {
    conn.execute(statement).await.map_err(|err| {
        warn!(
            target: "sitebackup",
            event = "import_statement_failed",
            statement_index = index,
            error = %err
        );
        err.reclassify(ErrorKind::ImportExec, "A statement of the dump failed")
            .with_context("statement_index", index.to_string())
            .with_context("statement", preview(statement))
    })
}

fn preview(statement: &str) -> String {
    let mut chars = statement.chars();
    let head: String = chars.by_ref().take(STATEMENT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn exec_error(err: AppError, operation: &str) -> AppError {
    err.reclassify(ErrorKind::ImportExec, "Replacing the database failed")
        .with_context("operation", operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_statements() {
        let long = "x".repeat(STATEMENT_PREVIEW_CHARS + 10);
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), STATEMENT_PREVIEW_CHARS + 3);
        assert_eq!(preview("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn missing_source_is_file_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = prepare(&tmp.path().join("absent.sql"), tmp.path(), "utf8").unwrap_err();
        assert!(err.is(ErrorKind::FileNotFound));
        assert!(err.context().contains_key("file"));
    }

    #[test]
    fn mismatched_charset_stops_before_replace() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("dump.sql");
        std::fs::write(&source, "CREATE TABLE t (id int) DEFAULT CHARSET=utf8mb4;\n").unwrap();
        let err = prepare(&source, &tmp.path().join("work"), "utf8").unwrap_err();
        assert!(err.is(ErrorKind::CharsetMismatch));
        assert_eq!(err.context().get("declared").map(String::as_str), Some("utf8mb4"));
    }
}
