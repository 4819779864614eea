//! Zip archives of the application tree.
//!
//! Entry names are paths relative to the archived root, always separated by
//! `/`. The same normalization is used to match [`ExclusionRules`], so a rule
//! written as `MyFiles/Cache` behaves identically on every platform.

pub mod restore;

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::{GENERATED_DIR, USER_DATA_DIR};
use crate::fsutil::{self, PartialFileGuard};
use crate::{AppError, AppResult, ErrorKind};

pub use restore::{extract_and_merge, RestoreReport, StagingTree};

pub const ARCHIVE_EXTENSION: &str = "zip";
const LARGE_FILE_BYTES: u64 = u32::MAX as u64;

/// Ordered relative-path prefixes left out of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExclusionRules {
    prefixes: Vec<String>,
}

impl Default for ExclusionRules {
    /// Backups, cache, temp and generated code of a standard installation.
    fn default() -> Self {
        Self::new([
            format!("{USER_DATA_DIR}/Backups"),
            format!("{USER_DATA_DIR}/Cache"),
            format!("{USER_DATA_DIR}/Tmp"),
            GENERATED_DIR.to_string(),
        ])
    }
}

impl ExclusionRules {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|prefix| prefix.into().replace('\\', "/"))
                .filter(|prefix| !prefix.is_empty())
                .collect(),
        }
    }

    pub fn none() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Plain string-prefix match against a forward-slash relative path.
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| relative.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<String>,
    pub size_bytes: u64,
}

/// `a/b/c.txt` for `root/a/b/c.txt`. `None` when `path` is not below `root`
/// or contains components that have no portable spelling.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
}

/// Sorted walk below `root` that never descends into an excluded directory.
fn kept_entries<'a>(
    root: &'a Path,
    rules: &'a ExclusionRules,
) -> impl Iterator<Item = walkdir::Result<DirEntry>> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            relative_name(root, entry.path()).map_or(true, |name| !rules.is_excluded(&name))
        })
}

/// Writes every regular, non-excluded, non-`.zip` file under `root` into the
/// archive at `destination`.
pub fn archive_tree(
    root: &Path,
    destination: &Path,
    rules: &ExclusionRules,
) -> AppResult<ArchiveArtifact> {
    let started = Instant::now();
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            open_error(err.into(), destination).with_context("operation", "create_parent")
        })?;
    }

    let mut guard = PartialFileGuard::new(fsutil::partial_path(destination));
    let file = File::create(guard.path()).map_err(|err| open_error(err.into(), destination))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = Vec::new();
    for entry in kept_entries(root, rules) {
        let entry = entry.map_err(|err| {
            let path = err.path().map(|p| p.display().to_string()).unwrap_or_default();
            let cause = err
                .into_io_error()
                .map(AppError::from)
                .unwrap_or_else(|| AppError::from("filesystem loop while walking the tree"));
            write_error(cause, destination, "walk").with_context("entry", path)
        })?;
        if !entry.file_type().is_file() || is_zip(entry.path()) || entry.path() == guard.path() {
            continue;
        }
        let Some(name) = relative_name(root, entry.path()) else {
            tracing::warn!(
                target: "sitebackup",
                event = "archive_entry_skipped",
                path = %entry.path().display(),
                "path has no portable name"
            );
            continue;
        };

        let mut source = File::open(entry.path()).map_err(|err| {
            write_error(err.into(), destination, "open_entry").with_context("entry", name.clone())
        })?;
        let large = entry
            .metadata()
            .map(|meta| meta.len() >= LARGE_FILE_BYTES)
            .unwrap_or(false);
        writer
            .start_file(name.as_str(), options.large_file(large))
            .map_err(|err| {
                write_error(err.into(), destination, "start_entry").with_context("entry", name.clone())
            })?;
        io::copy(&mut source, &mut writer).map_err(|err| {
            write_error(err.into(), destination, "copy_entry").with_context("entry", name.clone())
        })?;
        entries.push(name);
    }

    let buffered = writer
        .finish()
        .map_err(|err| write_error(err.into(), destination, "finish"))?;
    let file = buffered
        .into_inner()
        .map_err(|err| write_error(err.into_error().into(), destination, "flush"))?;
    file.sync_all()
        .map_err(|err| write_error(err.into(), destination, "sync"))?;
    drop(file);
    fs::rename(guard.path(), destination)
        .map_err(|err| write_error(err.into(), destination, "finalize"))?;
    guard.disarm();
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fsutil::sync_dir(parent).ok();
    }

    let size_bytes = fs::metadata(destination).map(|meta| meta.len()).unwrap_or(0);
    tracing::info!(
        target: "sitebackup",
        event = "archive_created",
        path = %destination.display(),
        entries = entries.len(),
        bytes = size_bytes,
        ms = started.elapsed().as_millis() as u64
    );
    Ok(ArchiveArtifact {
        path: destination.to_path_buf(),
        created_at: Utc::now(),
        entries,
        size_bytes,
    })
}

fn open_error(err: AppError, destination: &Path) -> AppError {
    err.reclassify(ErrorKind::ArchiveOpen, "The archive could not be created")
        .with_context("path", destination.display().to_string())
}

fn write_error(err: AppError, destination: &Path, operation: &str) -> AppError {
    err.reclassify(ErrorKind::ArchiveWrite, "Writing the archive failed")
        .with_context("operation", operation)
        .with_context("path", destination.display().to_string())
}
