use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::Serialize;
use zip::ZipArchive;

use crate::{AppError, AppResult, ErrorKind};

/// Name of the extraction directory under the application's temp folder.
pub const STAGING_DIR_NAME: &str = "restore-staging";

/// Relative paths restored from an archive and paths left alone because
/// the destination already had them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
}

/// Extraction directory that exists only for the lifetime of the value.
#[derive(Debug)]
pub struct StagingTree {
    path: PathBuf,
}

impl StagingTree {
    /// Creates an empty staging directory, wiping leftovers of an earlier run.
    pub fn create(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|err| staging_error(err, &path, "clear"))?;
        }
        fs::create_dir_all(&path).map_err(|err| staging_error(err, &path, "create"))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingTree {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    target: "sitebackup",
                    event = "staging_remove_failed",
                    error = %err,
                    path = %self.path.display()
                );
            }
        }
    }
}

fn staging_error(err: io::Error, path: &Path, operation: &str) -> AppError {
    AppError::from(err)
        .reclassify(ErrorKind::ArchiveExtract, "The staging directory could not be prepared")
        .with_context("operation", operation)
        .with_context("path", path.display().to_string())
}

/// Extracts `archive` into `staging_dir` and merges the result into
/// `destination_root`. Existing destination paths are never overwritten.
pub fn extract_and_merge(
    archive: &Path,
    destination_root: &Path,
    staging_dir: &Path,
) -> AppResult<RestoreReport> {
    if !archive.is_file() {
        return Err(
            AppError::of(ErrorKind::FileNotFound, "The archive does not exist")
                .with_context("file", archive.display().to_string()),
        );
    }
    let file = File::open(archive).map_err(|err| open_error(err.into(), archive))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|err| open_error(err.into(), archive))?;

    let staging = StagingTree::create(staging_dir)?;
    extract_all(&mut zip, staging.path(), archive)?;

    let mut report = RestoreReport::default();
    merge_dir(staging.path(), destination_root, "", staging.path(), &mut report).map_err(
        |err| {
            AppError::from(err)
                .reclassify(ErrorKind::ArchiveExtract, "Merging the restored files failed")
                .with_context("operation", "merge")
                .with_context("file", archive.display().to_string())
        },
    )?;

    tracing::info!(
        target: "sitebackup",
        event = "files_restored",
        archive = %archive.display(),
        restored = report.restored.len(),
        skipped = report.skipped.len()
    );
    Ok(report)
}

fn extract_all<R: io::Read + io::Seek>(
    zip: &mut ZipArchive<R>,
    staging: &Path,
    archive: &Path,
) -> AppResult<()> {
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| extract_error(err.into(), archive).with_context("entry_index", index.to_string()))?;
        let name = entry.name().to_string();
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(AppError::of(
                ErrorKind::ArchiveExtract,
                "Archive entry escapes the extraction directory",
            )
            .with_context("entry", name)
            .with_context("file", archive.display().to_string()));
        };
        let target = staging.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| extract_error(err.into(), archive).with_context("entry", name))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                extract_error(err.into(), archive).with_context("entry", name.clone())
            })?;
        }
        let out = File::create(&target)
            .map_err(|err| extract_error(err.into(), archive).with_context("entry", name.clone()))?;
        let mut out = BufWriter::new(out);
        io::copy(&mut entry, &mut out)
            .map_err(|err| extract_error(err.into(), archive).with_context("entry", name.clone()))?;
        out.into_inner()
            .map_err(|err| extract_error(err.into_error().into(), archive).with_context("entry", name))?;
    }
    Ok(())
}

/// Copies every staged child of `staged` into `dest` unless `dest` already
/// has something at that path. Directories present on both sides are merged.
fn merge_dir(
    staged: &Path,
    dest: &Path,
    prefix: &str,
    staging_root: &Path,
    report: &mut RestoreReport,
) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut children = fs::read_dir(staged)?.collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let name = child.file_name();
        let relative = if prefix.is_empty() {
            name.to_string_lossy().into_owned()
        } else {
            format!("{prefix}/{}", name.to_string_lossy())
        };
        let source = child.path();
        let target = dest.join(&name);
        if target.starts_with(staging_root) {
            continue;
        }

        match fs::symlink_metadata(&target) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                move_into_place(&source, &target)?;
                report.restored.push(relative);
            }
            Err(err) => return Err(err),
            Ok(existing) => {
                if existing.is_dir() && child.file_type()?.is_dir() {
                    merge_dir(&source, &target, &relative, staging_root, report)?;
                } else {
                    tracing::debug!(
                        target: "sitebackup",
                        event = "restore_kept_existing",
                        path = %relative
                    );
                    report.skipped.push(relative);
                }
            }
        }
    }
    Ok(())
}

fn move_into_place(source: &Path, target: &Path) -> io::Result<()> {
    if fs::rename(source, target).is_ok() {
        return Ok(());
    }
    copy_tree(source, target)
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    if fs::symlink_metadata(source)?.is_dir() {
        fs::create_dir_all(target)?;
        for child in fs::read_dir(source)? {
            let child = child?;
            copy_tree(&child.path(), &target.join(child.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(source, target).map(|_| ())
    }
}

fn open_error(err: AppError, archive: &Path) -> AppError {
    err.reclassify(ErrorKind::ArchiveOpen, "The archive could not be opened")
        .with_context("file", archive.display().to_string())
}

fn extract_error(err: AppError, archive: &Path) -> AppError {
    err.reclassify(ErrorKind::ArchiveExtract, "Extracting the archive failed")
        .with_context("file", archive.display().to_string())
}
