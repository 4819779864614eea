//! Schedule bookkeeping for the unattended backup job.
//!
//! The host's scheduler calls the job as often as it likes; the job only runs
//! when [`BackupJob::is_due`] says so. The last run is kept in
//! `job-state.json` next to the artifacts it produced.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::fsutil;
use crate::{AppError, AppResult};

pub const JOB_NAME: &str = "weekly-backup";
pub const JOB_STATE_FILE: &str = "job-state.json";

/// Notifier keys emitted by a job run.
pub const SQL_FILE_ERROR_KEY: &str = "sql-file-error";
pub const ZIP_FILE_ERROR_KEY: &str = "zip-file-error";
pub const BACKUP_CREATED_KEY: &str = "backup-created";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub name: String,
    pub interval: Duration,
}

impl Default for BackupJob {
    fn default() -> Self {
        Self {
            name: JOB_NAME.to_string(),
            interval: Duration::weeks(1),
        }
    }
}

impl BackupJob {
    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_run {
            None => true,
            Some(last) => now - last >= self.interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    SqlFailed,
    ZipFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job: String,
    pub last_run: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

pub fn state_path(backups_dir: &Path) -> PathBuf {
    backups_dir.join(JOB_STATE_FILE)
}

/// `None` when the job has never run. A corrupt state file is treated the
/// same way so the job is not blocked forever.
pub fn load_state(backups_dir: &Path) -> AppResult<Option<JobState>> {
    let path = state_path(backups_dir);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "read_job_state")
                .with_context("path", path.display().to_string()))
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(state) => Ok(Some(state)),
        Err(err) => {
            tracing::warn!(
                target: "sitebackup",
                event = "job_state_unreadable",
                error = %err,
                path = %path.display()
            );
            Ok(None)
        }
    }
}

pub fn save_state(backups_dir: &Path, state: &JobState) -> AppResult<()> {
    let path = state_path(backups_dir);
    let bytes = serde_json::to_vec_pretty(state)?;
    fsutil::write_atomic(&path, &bytes).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_job_state")
            .with_context("path", path.display().to_string())
    })
}
