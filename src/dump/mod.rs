//! Streaming SQL export.
//!
//! A dump is produced table by table and row batch by row batch straight
//! into `<name>.sql.partial`; only a complete, flushed file is renamed onto
//! the canonical path.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DatabaseConnectionConfig;
use crate::db::{quote_ident, RowSink, SqlConnection, SqlValue};
use crate::fsutil::{self, PartialFileGuard};
use crate::notify::Notifier;
use crate::{AppError, AppResult, ErrorKind};

pub const DUMP_EXTENSION: &str = "sql";
pub const DUMP_NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const ROWS_PER_INSERT: usize = 100;
const MAX_INSERT_BYTES: usize = 1024 * 1024;
const WRITE_BUFFER_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub rows: u64,
}

/// A finished dump on disk.
#[derive(Debug, Clone, Serialize)]
pub struct ExportArtifact {
    pub path: PathBuf,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub sha256: String,
    pub tables: Vec<TableSummary>,
}

/// `2024-03-01_02-00-00.sql`
pub fn default_dump_name(now: DateTime<Utc>) -> String {
    format!("{}.{DUMP_EXTENSION}", now.format(DUMP_NAME_FORMAT))
}

/// Keeps only the file-name component and guarantees a single `.sql` suffix.
/// `None` when nothing usable is left of the name.
pub fn normalize_dump_name(name: &str) -> Option<String> {
    let base = Path::new(name)
        .file_name()
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = base.strip_suffix(".gz").unwrap_or(&base);
    let stem = base.trim_end_matches(".sql").trim();
    (!stem.is_empty() && stem != "." && stem != "..").then(|| format!("{stem}.{DUMP_EXTENSION}"))
}

/// Checks that must pass before a connection is opened or a byte is written.
///
/// Emits `backup-port-warning` for non-default ports; that warning never
/// blocks the export.
pub fn preflight(
    config: &DatabaseConnectionConfig,
    destination_dir: &Path,
    driver_available: bool,
    notifier: &dyn Notifier,
) -> AppResult<()> {
    config.ensure_supported()?;
    if !driver_available {
        return Err(AppError::of(
            ErrorKind::DriverMissing,
            "This build does not include a MySQL driver",
        ));
    }
    if !config.uses_default_port() {
        warn!(
            target: "sitebackup",
            event = "export_unexpected_port",
            port = config.port,
            default_port = config.engine.default_port()
        );
        notifier.warning("backup-port-warning", &[("%port%", config.port.to_string())]);
    }
    ensure_directory(destination_dir)
}

pub fn ensure_directory(dir: &Path) -> AppResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|err| {
        AppError::from(err)
            .reclassify(ErrorKind::DirectoryCreate, "Backup directory could not be created")
            .with_context("path", dir.display().to_string())
    })
}

/// Writes a complete dump of the connected schema to `destination_dir/<name>`.
pub async fn export_to<C: SqlConnection>(
    conn: &mut C,
    config: &DatabaseConnectionConfig,
    destination_dir: &Path,
    file_name: &str,
) -> AppResult<ExportArtifact> {
    let name = normalize_dump_name(file_name).unwrap_or_else(|| {
        let fallback = default_dump_name(Utc::now());
        warn!(
            target: "sitebackup",
            event = "dump_name_replaced",
            requested = file_name,
            name = %fallback
        );
        fallback
    });
    let final_path = destination_dir.join(&name);
    let started = Instant::now();

    let tables = conn.list_tables().await?;
    if tables.is_empty() {
        return Err(AppError::of(
            ErrorKind::EmptySchema,
            "The database has no tables to export",
        )
        .with_context("database", config.name.clone()));
    }
    let server_version = conn
        .server_version()
        .await
        .unwrap_or_else(|_| "unknown".to_string());

    let mut guard = PartialFileGuard::new(fsutil::partial_path(&final_path));
    let file = File::create(guard.path()).map_err(|err| {
        write_error(err.into(), guard.path(), "create_partial")
    })?;
    let mut out = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);

    let created_at = Utc::now();
    write_header(&mut out, config, &server_version, created_at)
        .map_err(|err| write_error(err.into(), guard.path(), "write_header"))?;

    conn.begin_consistent_read().await?;
    let dumped = dump_tables(conn, &tables, &mut out, guard.path()).await;
    let finished = conn.end_consistent_read().await;
    let summaries = dumped?;
    finished?;

    writeln!(out, "SET FOREIGN_KEY_CHECKS=1;")
        .and_then(|_| writeln!(out, "\n-- Dump completed {}", rfc3339(Utc::now())))
        .map_err(|err| write_error(err.into(), guard.path(), "write_trailer"))?;
    let file = out
        .into_inner()
        .map_err(|err| write_error(err.into_error().into(), guard.path(), "flush"))?;
    file.sync_all()
        .map_err(|err| write_error(err.into(), guard.path(), "sync"))?;
    drop(file);

    fs::rename(guard.path(), &final_path).map_err(|err| {
        write_error(err.into(), guard.path(), "finalize")
            .with_context("to", final_path.display().to_string())
    })?;
    guard.disarm();
    fsutil::sync_dir(destination_dir).ok();

    let size_bytes = fs::metadata(&final_path).map(|meta| meta.len()).unwrap_or(0);
    let sha256 = fsutil::file_sha256(&final_path)
        .map_err(|err| AppError::from(err).with_context("operation", "hash_dump"))?;

    info!(
        target: "sitebackup",
        event = "export_finished",
        path = %final_path.display(),
        tables = summaries.len(),
        bytes = size_bytes,
        ms = started.elapsed().as_millis() as u64
    );

    Ok(ExportArtifact {
        path: final_path,
        name,
        created_at,
        size_bytes,
        sha256,
        tables: summaries,
    })
}

async fn dump_tables<C: SqlConnection, W: Write>(
    conn: &mut C,
    tables: &[String],
    out: &mut W,
    partial: &Path,
) -> AppResult<Vec<TableSummary>> {
    let mut summaries = Vec::with_capacity(tables.len());
    for table in tables {
        let create = conn.show_create_table(table).await?;
        write_structure(out, table, &create)
            .map_err(|err| write_error(err.into(), partial, "write_structure"))?;

        let mut batcher = InsertBatcher::new(out, table);
        let rows = conn
            .stream_rows(table, &mut batcher)
            .await
            .map_err(|err| err.with_context("table", table.clone()))?;
        batcher
            .finish()
            .map_err(|err| write_error(err, partial, "write_rows"))?;

        tracing::debug!(target: "sitebackup", event = "export_table", table = %table, rows);
        summaries.push(TableSummary {
            name: table.clone(),
            rows,
        });
    }
    Ok(summaries)
}

fn write_header<W: Write>(
    out: &mut W,
    config: &DatabaseConnectionConfig,
    server_version: &str,
    created_at: DateTime<Utc>,
) -> std::io::Result<()> {
    writeln!(out, "-- sitebackup SQL dump {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "--")?;
    writeln!(out, "-- Host: {}:{}", config.host, config.port)?;
    writeln!(out, "-- Database: {}", config.name)?;
    writeln!(out, "-- Server version: {server_version}")?;
    writeln!(out, "-- Generated: {}", rfc3339(created_at))?;
    writeln!(out, "-- ------------------------------------------------------")?;
    writeln!(out)?;
    writeln!(out, "SET NAMES utf8mb4;")?;
    writeln!(out, "SET FOREIGN_KEY_CHECKS=0;")?;
    writeln!(out, "SET SQL_MODE='NO_AUTO_VALUE_ON_ZERO';")?;
    writeln!(out, "SET time_zone = '+00:00';")?;
    writeln!(out)
}

fn write_structure<W: Write>(out: &mut W, table: &str, create: &str) -> std::io::Result<()> {
    let ident = quote_ident(table);
    writeln!(out, "--")?;
    writeln!(out, "-- Table structure for {ident}")?;
    writeln!(out, "--")?;
    writeln!(out)?;
    writeln!(out, "DROP TABLE IF EXISTS {ident};")?;
    writeln!(out, "{};", create.trim_end().trim_end_matches(';'))?;
    writeln!(out)
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn write_error(err: AppError, partial: &Path, operation: &str) -> AppError {
    err.reclassify(ErrorKind::ExportWrite, "Writing the SQL dump failed")
        .with_context("operation", operation)
        .with_context("path", partial.display().to_string())
}

/// Groups streamed rows into multi-row `INSERT` statements.
struct InsertBatcher<'w, W: Write> {
    out: &'w mut W,
    prefix: String,
    pending: Vec<String>,
    pending_bytes: usize,
}

impl<'w, W: Write> InsertBatcher<'w, W> {
    fn new(out: &'w mut W, table: &str) -> Self {
        Self {
            out,
            prefix: format!("INSERT INTO {} VALUES\n", quote_ident(table)),
            pending: Vec::with_capacity(ROWS_PER_INSERT),
            pending_bytes: 0,
        }
    }

    fn flush_pending(&mut self) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.out.write_all(self.prefix.as_bytes())?;
        self.out.write_all(self.pending.join(",\n").as_bytes())?;
        self.out.write_all(b";\n")?;
        self.pending.clear();
        self.pending_bytes = 0;
        Ok(())
    }

    fn finish(mut self) -> AppResult<()> {
        self.flush_pending()?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> RowSink for InsertBatcher<'_, W> {
    fn push_row(&mut self, row: Vec<SqlValue>) -> AppResult<()> {
        let tuple = format!(
            "({})",
            row.iter()
                .map(SqlValue::to_literal)
                .collect::<Vec<_>>()
                .join(",")
        );
        self.pending_bytes += tuple.len();
        self.pending.push(tuple);
        if self.pending.len() >= ROWS_PER_INSERT || self.pending_bytes >= MAX_INSERT_BYTES {
            self.flush_pending().map_err(|err| {
                AppError::from(err).reclassify(ErrorKind::ExportWrite, "Writing the SQL dump failed")
            })?;
        }
        Ok(())
    }
}
