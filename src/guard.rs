//! Advisory capacity checks run before large file operations.
//!
//! Nothing here blocks an operation; callers turn the returned warnings into
//! notifier messages.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use fs2::available_space;
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::{AppError, AppResult};

const MIB: u64 = 1024 * 1024;
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const MIN_REQUIRED_FREE_BYTES: u64 = 100 * MIB;

pub const MEMORY_WARNING_KEY: &str = "backup-memory-warning";
pub const LOW_DISK_WARNING_KEY: &str = "backup-low-disk";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitParseError {
    #[error("memory limit is empty")]
    Empty,
    #[error("memory limit {0:?} is not a size")]
    Invalid(String),
}

/// A memory ceiling written the `php.ini` way: `-1`, `134217728`, `512M`,
/// `1G`, `64k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemoryLimit {
    Unlimited,
    Bytes(u64),
}

impl MemoryLimit {
    pub fn megabytes(self) -> Option<u64> {
        match self {
            MemoryLimit::Unlimited => None,
            MemoryLimit::Bytes(bytes) => Some(bytes / MIB),
        }
    }
}

impl FromStr for MemoryLimit {
    type Err = LimitParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(LimitParseError::Empty);
        }
        if value.starts_with('-') {
            return Ok(MemoryLimit::Unlimited);
        }
        let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_uppercase()) {
            Some('K') => (&value[..value.len() - 1], 1024),
            Some('M') => (&value[..value.len() - 1], MIB),
            Some('G') => (&value[..value.len() - 1], MIB * 1024),
            _ => (value, 1),
        };
        let amount = digits
            .trim()
            .parse::<u64>()
            .map_err(|_| LimitParseError::Invalid(raw.to_string()))?;
        Ok(MemoryLimit::Bytes(amount.saturating_mul(multiplier)))
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLimit::Unlimited => f.write_str("unlimited"),
            MemoryLimit::Bytes(bytes) => write!(f, "{}M", bytes / MIB),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityWarning {
    pub total_mb: u64,
    pub limit_mb: u64,
}

impl CapacityWarning {
    pub fn params(&self) -> [(&'static str, String); 2] {
        [
            ("%size%", self.total_mb.to_string()),
            ("%limit%", self.limit_mb.to_string()),
        ]
    }
}

/// Bytes held by regular files under `root`. Unreadable entries are skipped.
pub fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

pub fn exceeds_budget(total_bytes: u64, limit: MemoryLimit) -> Option<CapacityWarning> {
    let limit_mb = limit.megabytes()?;
    let total_mb = total_bytes / MIB;
    (total_mb >= limit_mb).then_some(CapacityWarning { total_mb, limit_mb })
}

/// Warns when the files under `root` would not fit in the memory ceiling.
pub fn check_capacity(root: &Path, limit: MemoryLimit) -> Option<CapacityWarning> {
    if limit == MemoryLimit::Unlimited {
        return None;
    }
    let total = tree_size(root);
    let warning = exceeds_budget(total, limit);
    if let Some(found) = &warning {
        tracing::warn!(
            target: "sitebackup",
            event = "capacity_exceeded",
            root = %root.display(),
            total_mb = found.total_mb,
            limit_mb = found.limit_mb
        );
    }
    warning
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskSpaceWarning {
    pub available_bytes: u64,
    pub required_bytes: u64,
}

impl DiskSpaceWarning {
    pub fn params(&self) -> [(&'static str, String); 2] {
        [
            ("%available%", format_megabytes(self.available_bytes)),
            ("%required%", format_megabytes(self.required_bytes)),
        ]
    }
}

/// Free space needed to write an artifact estimated at `estimate` bytes.
pub fn required_free_bytes(estimate: u64) -> u64 {
    if estimate == 0 {
        return MIN_REQUIRED_FREE_BYTES;
    }
    (estimate as f64 * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

pub fn check_disk_space(dir: &Path, estimate: u64) -> AppResult<Option<DiskSpaceWarning>> {
    let required_bytes = required_free_bytes(estimate);
    let available_bytes = free_disk_space(dir)?;
    if available_bytes >= required_bytes {
        return Ok(None);
    }
    tracing::warn!(
        target: "sitebackup",
        event = "low_disk_space",
        path = %dir.display(),
        available_bytes,
        required_bytes
    );
    Ok(Some(DiskSpaceWarning {
        available_bytes,
        required_bytes,
    }))
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Ok(fake) = env::var("SITEBACKUP_FAKE_FREE_BYTES") {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }

    let target: PathBuf = path
        .ancestors()
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from("/")));
    available_space(&target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", target.display().to_string())
    })
}

fn format_megabytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 MB".to_string();
    }
    let mb = bytes as f64 / MIB as f64;
    if mb < 1.0 {
        "1 MB".to_string()
    } else {
        format!("{:.0} MB", mb.ceil())
    }
}
