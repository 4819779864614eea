//! The backup engine: one object exposing every operation, with its
//! collaborators injected at construction.
//!
//! Each public operation reports its own failure through the notifier exactly
//! once and then returns the error, so adapters only need to map the result
//! to an exit status or a response.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive::restore::STAGING_DIR_NAME;
use crate::archive::{self, ArchiveArtifact, ExclusionRules, RestoreReport, ARCHIVE_EXTENSION};
use crate::artifacts::{self, ArtifactEntry, DownloadDescriptor, StaleBackup};
use crate::config::{DatabaseConnectionConfig, Settings};
use crate::cron::{self, BackupJob, JobState, JobStatus};
use crate::db::{self, quote_ident, Connector, SqlConnection};
use crate::dump::{self, ExportArtifact};
use crate::guard::{self, CapacityWarning, MemoryLimit};
use crate::import::{self, ImportReport};
use crate::notify::{
    CacheDirInvalidator, CacheInvalidator, NoSessions, Notifier, SessionInvalidator,
    TracingNotifier,
};
use crate::{AppError, AppResult, ErrorKind};

pub const RECORD_UPDATED_KEY: &str = "record-updated-correctly";
const FALLBACK_ERROR_KEY: &str = "record-save-error";
/// Error context keys forwarded to the notifier as `%key%` placeholders.
const NOTIFIED_CONTEXT: [&str; 5] = ["file", "declared", "expected", "table", "port"];

static CHARSET_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid charset name pattern"));

/// Operations a triggering collaborator can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Export { file_name: Option<String> },
    Archive { file_name: Option<String> },
    ImportDatabase { source: PathBuf },
    ImportFiles { archive: PathBuf },
    CharsetSwitch {
        charset: Option<String>,
        collation: Option<String>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Export { .. } => "export",
            Action::Archive { .. } => "archive",
            Action::ImportDatabase { .. } => "import-database",
            Action::ImportFiles { .. } => "import-files",
            Action::CharsetSwitch { .. } => "charset-switch",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Outcome {
    Export(ExportArtifact),
    Archive(ArchiveArtifact),
    ImportDatabase(ImportReport),
    ImportFiles(RestoreReport),
    CharsetSwitch(CharsetSwitchReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharsetSwitchReport {
    pub charset: String,
    pub collation: String,
    pub tables: Vec<String>,
}

pub struct BackupEngine<K> {
    settings: Settings,
    connector: K,
    notifier: Arc<dyn Notifier>,
    cache: Arc<dyn CacheInvalidator>,
    sessions: Arc<dyn SessionInvalidator>,
    exclusions: ExclusionRules,
    driver_available: bool,
    job: BackupJob,
}

impl<K: Connector> BackupEngine<K> {
    /// An engine that logs its notifications, clears the on-disk cache folder
    /// after a database import and has no session layer.
    pub fn new(settings: Settings, connector: K) -> Self {
        let cache = Arc::new(CacheDirInvalidator {
            dir: settings.cache_dir(),
        });
        Self {
            settings,
            connector,
            notifier: Arc::new(TracingNotifier),
            cache,
            sessions: Arc::new(NoSessions),
            exclusions: ExclusionRules::default(),
            driver_available: db::driver_available(),
            job: BackupJob::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionInvalidator>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_exclusions(mut self, exclusions: ExclusionRules) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Overrides the compiled-in driver check.
    pub fn with_driver_available(mut self, available: bool) -> Self {
        self.driver_available = available;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn config(&self) -> &DatabaseConnectionConfig {
        &self.settings.database
    }

    pub async fn dispatch(&self, action: Action) -> AppResult<Outcome> {
        info!(target: "sitebackup", event = "action_started", action = action.name());
        match action {
            Action::Export { file_name } => self
                .export_database(file_name.as_deref())
                .await
                .map(Outcome::Export),
            Action::Archive { file_name } => {
                self.archive_files(file_name.as_deref()).map(Outcome::Archive)
            }
            Action::ImportDatabase { source } => self
                .import_database(&source)
                .await
                .map(Outcome::ImportDatabase),
            Action::ImportFiles { archive } => {
                self.import_files(&archive).map(Outcome::ImportFiles)
            }
            Action::CharsetSwitch { charset, collation } => self
                .switch_charset(charset.as_deref(), collation.as_deref())
                .await
                .map(Outcome::CharsetSwitch),
        }
    }

    /// Dumps the configured database into the backups directory.
    pub async fn export_database(&self, file_name: Option<&str>) -> AppResult<ExportArtifact> {
        let result = self.export_inner(file_name, Utc::now()).await;
        self.reported(result, "export")
    }

    async fn export_inner(
        &self,
        file_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<ExportArtifact> {
        let dir = self.settings.backups_dir();
        dump::preflight(self.config(), &dir, self.driver_available, self.notifier.as_ref())?;
        self.warn_low_disk(&dir, 0);

        let name = file_name
            .map(str::to_string)
            .unwrap_or_else(|| dump::default_dump_name(now));
        let mut conn = self.connector.connect(self.config()).await?;
        let exported = dump::export_to(&mut conn, self.config(), &dir, &name).await;
        close_quietly(&mut conn).await;
        exported
    }

    /// Zips the application tree into the backups directory.
    pub fn archive_files(&self, file_name: Option<&str>) -> AppResult<ArchiveArtifact> {
        let result = self.archive_inner(file_name, Utc::now());
        self.reported(result, "archive")
    }

    fn archive_inner(&self, file_name: Option<&str>, now: DateTime<Utc>) -> AppResult<ArchiveArtifact> {
        let dir = self.settings.backups_dir();
        dump::ensure_directory(&dir)?;
        let name = archive_name(file_name, now);
        self.advise_capacity();
        self.warn_low_disk(&dir, guard::tree_size(&self.settings.base_dir));
        archive::archive_tree(&self.settings.base_dir, &dir.join(name), &self.exclusions)
    }

    /// Validates `source` and replaces the whole database with it.
    ///
    /// The charset gate and every file check run before a connection is
    /// opened. Once tables start being dropped a failure leaves the database
    /// partially migrated.
    pub async fn import_database(&self, source: &Path) -> AppResult<ImportReport> {
        let result = self.import_inner(source).await;
        let result = self.reported(result, "import_database");
        if result.is_ok() {
            self.cache.clear_all();
            self.sessions.clear_session_cookies();
            self.notifier.notice(RECORD_UPDATED_KEY, &[]);
        }
        result
    }

    async fn import_inner(&self, source: &Path) -> AppResult<ImportReport> {
        self.ensure_database_support()?;
        let prepared = import::prepare(source, &self.settings.tmp_dir(), &self.settings.charset)?;

        let mut conn = self.connector.connect(self.config()).await?;
        let replaced = import::replace_database(&mut conn, prepared.path()).await;
        close_quietly(&mut conn).await;
        let summary = replaced.map_err(|err| err.with_context("file", source.display().to_string()))?;

        Ok(ImportReport {
            source: prepared.source.clone(),
            was_compressed: prepared.was_compressed(),
            charset: prepared.charset.clone(),
            dropped_tables: summary.dropped_tables,
            statements: summary.statements,
        })
    }

    /// Restores files from a zip without overwriting anything that exists.
    pub fn import_files(&self, archive_path: &Path) -> AppResult<RestoreReport> {
        self.advise_capacity();
        let staging = self.settings.tmp_dir().join(STAGING_DIR_NAME);
        let result = archive::extract_and_merge(archive_path, &self.settings.base_dir, &staging);
        let result = self.reported(result, "import_files");
        if result.is_ok() {
            self.notifier.notice(RECORD_UPDATED_KEY, &[]);
        }
        result
    }

    /// Converts the database and every table to `charset`/`collation`,
    /// defaulting to the configured values.
    pub async fn switch_charset(
        &self,
        charset: Option<&str>,
        collation: Option<&str>,
    ) -> AppResult<CharsetSwitchReport> {
        let charset = charset.unwrap_or(&self.settings.charset).to_string();
        let collation = collation.unwrap_or(&self.settings.collation).to_string();
        let result = self.switch_inner(charset, collation).await;
        let result = self.reported(result, "charset_switch");
        if result.is_ok() {
            self.notifier.notice(RECORD_UPDATED_KEY, &[]);
        }
        result
    }

    async fn switch_inner(&self, charset: String, collation: String) -> AppResult<CharsetSwitchReport> {
        self.ensure_database_support()?;
        for (label, value) in [("charset", &charset), ("collation", &collation)] {
            if !CHARSET_NAME.is_match(value) {
                return Err(AppError::of(ErrorKind::CharsetSwitch, "Invalid charset or collation name")
                    .with_context(label, value.clone()));
            }
        }

        let mut conn = self.connector.connect(self.config()).await?;
        let switched = convert_schema(&mut conn, &self.config().name, &charset, &collation).await;
        close_quietly(&mut conn).await;
        let tables = switched?;
        info!(
            target: "sitebackup",
            event = "charset_switched",
            charset = %charset,
            collation = %collation,
            tables = tables.len()
        );
        Ok(CharsetSwitchReport {
            charset,
            collation,
            tables,
        })
    }

    /// Advisory comparison of the application tree with the memory ceiling.
    pub fn check_capacity(&self) -> AppResult<Option<CapacityWarning>> {
        let result = self.capacity_warning();
        let result = self.reported(result, "check_capacity");
        if let Ok(Some(warning)) = &result {
            self.notifier
                .warning(guard::MEMORY_WARNING_KEY, &warning.params());
        }
        result
    }

    fn capacity_warning(&self) -> AppResult<Option<CapacityWarning>> {
        let limit: MemoryLimit = self.settings.memory_limit.parse().map_err(|err: guard::LimitParseError| {
            AppError::new("CONFIG/INVALID", err.to_string())
                .with_context("memory_limit", self.settings.memory_limit.clone())
        })?;
        Ok(guard::check_capacity(&self.settings.base_dir, limit))
    }

    /// Capacity check ahead of file operations. Never fails the caller; an
    /// unreadable limit is only logged.
    fn advise_capacity(&self) {
        match self.capacity_warning() {
            Ok(Some(warning)) => self
                .notifier
                .warning(guard::MEMORY_WARNING_KEY, &warning.params()),
            Ok(None) => {}
            Err(err) => {
                warn!(target: "sitebackup", event = "memory_limit_unreadable", error = %err);
            }
        }
    }

    fn warn_low_disk(&self, dir: &Path, estimate: u64) {
        match guard::check_disk_space(dir, estimate) {
            Ok(Some(warning)) => self
                .notifier
                .warning(guard::LOW_DISK_WARNING_KEY, &warning.params()),
            Ok(None) => {}
            Err(err) => {
                warn!(target: "sitebackup", event = "disk_space_unknown", error = %err);
            }
        }
    }

    pub fn artifacts(&self) -> AppResult<Vec<ArtifactEntry>> {
        artifacts::list_artifacts(&self.settings.backups_dir())
    }

    /// Warns with `backup-db-outdated` when the newest dump is too old.
    pub fn check_stale_backup(&self, now: DateTime<Utc>) -> AppResult<Option<StaleBackup>> {
        let stale = artifacts::stale_backup(&self.settings.backups_dir(), now)?;
        if let Some(found) = &stale {
            self.notifier
                .warning(artifacts::STALE_WARNING_KEY, &[("%days%", found.days.to_string())]);
        }
        Ok(stale)
    }

    pub fn download(&self, name: &str) -> AppResult<DownloadDescriptor> {
        let result = artifacts::download(&self.settings.backups_dir(), name);
        self.reported(result, "download")
    }

    /// Runs the scheduled job when it is due (or when `force` is set).
    ///
    /// Returns the recorded state, or `None` when nothing was due. Failures
    /// of the individual steps are recorded in the state rather than
    /// returned.
    pub async fn run_scheduled(&self, now: DateTime<Utc>, force: bool) -> AppResult<Option<JobState>> {
        let dir = self.settings.backups_dir();
        let last = cron::load_state(&dir)?.map(|state| state.last_run);
        if !force && !self.job.is_due(last, now) {
            info!(target: "sitebackup", event = "job_not_due", job = %self.job.name);
            return Ok(None);
        }
        info!(target: "sitebackup", event = "job_started", job = %self.job.name);

        let mut state = JobState {
            job: self.job.name.clone(),
            last_run: now,
            status: JobStatus::Succeeded,
            sql_file: None,
            zip_file: None,
            error_code: None,
        };

        let exported = self.export_inner(None, now).await;
        match self.reported(exported, "job_export") {
            Ok(artifact) => state.sql_file = Some(artifact.name),
            Err(err) => {
                self.notifier.error(cron::SQL_FILE_ERROR_KEY, &[]);
                state.status = JobStatus::SqlFailed;
                state.error_code = Some(err.code().to_string());
                cron::save_state(&dir, &state)?;
                return Ok(Some(state));
            }
        }

        let archived = self.archive_inner(None, now);
        match self.reported(archived, "job_archive") {
            Ok(artifact) => {
                state.zip_file = artifact
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
                self.notifier.notice(cron::BACKUP_CREATED_KEY, &[]);
            }
            Err(err) => {
                self.notifier.error(cron::ZIP_FILE_ERROR_KEY, &[]);
                state.status = JobStatus::ZipFailed;
                state.error_code = Some(err.code().to_string());
            }
        }
        cron::save_state(&dir, &state)?;
        Ok(Some(state))
    }

    fn ensure_database_support(&self) -> AppResult<()> {
        self.config().ensure_supported()?;
        if !self.driver_available {
            return Err(AppError::of(
                ErrorKind::DriverMissing,
                "This build does not include a MySQL driver",
            ));
        }
        Ok(())
    }

    /// Emits the single error notification for a failed operation.
    fn reported<T>(&self, result: AppResult<T>, operation: &str) -> AppResult<T> {
        if let Err(err) = &result {
            error!(
                target: "sitebackup",
                event = "operation_failed",
                operation,
                code = %err.code(),
                error = %err
            );
            let key = err
                .kind()
                .map(ErrorKind::message_key)
                .unwrap_or(FALLBACK_ERROR_KEY);
            let params: Vec<(&str, String)> = NOTIFIED_CONTEXT
                .iter()
                .zip(["%file%", "%declared%", "%expected%", "%table%", "%port%"])
                .filter_map(|(context_key, placeholder)| {
                    err.context()
                        .get(*context_key)
                        .map(|value| (placeholder, value.clone()))
                })
                .collect();
            self.notifier.error(key, &params);
        }
        result
    }
}

fn archive_name(file_name: Option<&str>, now: DateTime<Utc>) -> String {
    let base = match file_name {
        Some(name) => Path::new(name)
            .file_name()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_default(),
        None => now.format(dump::DUMP_NAME_FORMAT).to_string(),
    };
    let stem = base.trim_end_matches(".zip");
    format!("{stem}.{ARCHIVE_EXTENSION}")
}

async fn convert_schema<C: SqlConnection>(
    conn: &mut C,
    database: &str,
    charset: &str,
    collation: &str,
) -> AppResult<Vec<String>> {
    let switch_error = |err: AppError, statement: &str| {
        err.reclassify(ErrorKind::CharsetSwitch, "Changing the charset failed")
            .with_context("statement", statement.to_string())
    };

    let alter_db = format!(
        "ALTER DATABASE {} CHARACTER SET {charset} COLLATE {collation}",
        quote_ident(database)
    );
    conn.execute(&alter_db)
        .await
        .map_err(|err| switch_error(err, &alter_db))?;

    let tables = conn.list_tables().await?;
    for table in &tables {
        let alter = format!(
            "ALTER TABLE {} CONVERT TO CHARACTER SET {charset} COLLATE {collation}",
            quote_ident(table)
        );
        conn.execute(&alter)
            .await
            .map_err(|err| switch_error(err, &alter).with_context("table", table.clone()))?;
    }
    Ok(tables)
}

async fn close_quietly<C: SqlConnection>(conn: &mut C) {
    if let Err(err) = conn.close().await {
        warn!(target: "sitebackup", event = "db_close_failed", error = %err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn archive_names_get_zip_suffix() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        assert_eq!(archive_name(None, at), "2024-03-01_02-00-00.zip");
        assert_eq!(archive_name(Some("site"), at), "site.zip");
        assert_eq!(archive_name(Some("nested/site.zip"), at), "site.zip");
    }

    #[test]
    fn action_names_match_triggers() {
        assert_eq!(Action::Export { file_name: None }.name(), "export");
        assert_eq!(
            Action::ImportDatabase {
                source: PathBuf::from("x.sql")
            }
            .name(),
            "import-database"
        );
        assert_eq!(
            Action::CharsetSwitch {
                charset: None,
                collation: None
            }
            .name(),
            "charset-switch"
        );
    }
}
