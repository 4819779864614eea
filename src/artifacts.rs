//! Catalogue of the artifacts stored in the backup directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::dump::DUMP_NAME_FORMAT;
use crate::{AppError, AppResult, ErrorKind};

/// Dumps older than this many days are reported as outdated.
pub const STALE_AFTER_DAYS: i64 = 30;
pub const STALE_WARNING_KEY: &str = "backup-db-outdated";

static NAME_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2})").expect("valid timestamp pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SqlDump,
    CompressedDump,
    Archive,
}

impl ArtifactKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".sql.gz") {
            Some(ArtifactKind::CompressedDump)
        } else if lower.ends_with(".sql") {
            Some(ArtifactKind::SqlDump)
        } else if lower.ends_with(".zip") {
            Some(ArtifactKind::Archive)
        } else {
            None
        }
    }

    pub fn is_dump(self) -> bool {
        matches!(self, ArtifactKind::SqlDump | ArtifactKind::CompressedDump)
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArtifactKind::Archive => "application/zip",
            ArtifactKind::SqlDump | ArtifactKind::CompressedDump => "application/octet-stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Timestamp embedded in names like `2024-03-01_02-00-00.sql`.
pub fn timestamp_from_name(name: &str) -> Option<DateTime<Utc>> {
    let captured = NAME_TIMESTAMP.captures(name)?;
    NaiveDateTime::parse_from_str(&captured[1], DUMP_NAME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Artifacts in `dir`, newest first. A missing directory is an empty list.
pub fn list_artifacts(dir: &Path) -> AppResult<Vec<ArtifactEntry>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "list_artifacts")
                .with_context("path", dir.display().to_string()))
        }
    };

    let mut entries = Vec::new();
    for item in read {
        let item = item.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "list_artifacts")
                .with_context("path", dir.display().to_string())
        })?;
        let name = item.file_name().to_string_lossy().into_owned();
        let Some(kind) = ArtifactKind::from_name(&name) else {
            continue;
        };
        let Ok(meta) = item.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let created_at = timestamp_from_name(&name)
            .or_else(|| meta.modified().ok().map(DateTime::<Utc>::from))
            .unwrap_or_default();
        entries.push(ArtifactEntry {
            name,
            path: item.path(),
            kind,
            size_bytes: meta.len(),
            created_at,
        });
    }
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

pub fn latest_dump(dir: &Path) -> AppResult<Option<ArtifactEntry>> {
    Ok(list_artifacts(dir)?
        .into_iter()
        .find(|entry| entry.kind.is_dump()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleBackup {
    pub name: String,
    pub days: i64,
}

/// The newest dump, when it is more than [`STALE_AFTER_DAYS`] days old.
pub fn stale_backup(dir: &Path, now: DateTime<Utc>) -> AppResult<Option<StaleBackup>> {
    let Some(latest) = latest_dump(dir)? else {
        return Ok(None);
    };
    let days = (now - latest.created_at).num_days();
    if latest.created_at < now && days > STALE_AFTER_DAYS {
        tracing::warn!(target: "sitebackup", event = "backup_outdated", name = %latest.name, days);
        return Ok(Some(StaleBackup {
            name: latest.name,
            days,
        }));
    }
    Ok(None)
}

/// What a host needs to stream an artifact to a browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadDescriptor {
    pub path: PathBuf,
    pub content_type: &'static str,
    pub content_disposition: String,
}

/// Resolves `name` inside `dir`. Only plain artifact names are accepted.
pub fn download(dir: &Path, name: &str) -> AppResult<DownloadDescriptor> {
    let plain = Path::new(name)
        .file_name()
        .map(|value| value.to_string_lossy() == name)
        .unwrap_or(false);
    let kind = ArtifactKind::from_name(name).filter(|_| plain);
    let path = dir.join(name);
    let Some(kind) = kind.filter(|_| path.is_file()) else {
        return Err(AppError::of(ErrorKind::FileNotFound, "The backup file does not exist")
            .with_context("file", name.to_string()));
    };
    Ok(DownloadDescriptor {
        path,
        content_type: kind.content_type(),
        content_disposition: format!("attachment; filename=\"{}\"", name.replace('"', "")),
    })
}
