use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{AppError, AppResult, ErrorKind};

/// Only the head of a dump is inspected; table definitions come first in
/// every dump this crate produces or accepts.
pub const CHARSET_SCAN_LINES: usize = 1000;

static CHARSET_DECLARATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)CHARSET\s*=\s*([a-z0-9_]+)").expect("valid charset pattern")
});

/// `utf8mb3` is MySQL's spelling of the legacy `utf8` charset.
pub fn normalize_charset(charset: &str) -> String {
    let lowered = charset.trim().to_ascii_lowercase();
    if lowered == "utf8mb3" {
        "utf8".to_string()
    } else {
        lowered
    }
}

/// First `CHARSET=<value>` found in the first [`CHARSET_SCAN_LINES`] lines.
pub fn detect_charset(path: &Path) -> AppResult<Option<String>> {
    let file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_dump")
            .with_context("path", path.display().to_string())
    })?;
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    for _ in 0..CHARSET_SCAN_LINES {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        if let Some(found) = CHARSET_DECLARATION.captures(&line) {
            return Ok(Some(normalize_charset(&found[1])));
        }
    }
    Ok(None)
}

/// Fails with `CharsetMismatch` when the dump declares a charset other than
/// the configured one. A dump without a declaration passes.
pub fn verify_charset(declared: Option<&str>, expected: &str) -> AppResult<()> {
    let Some(declared) = declared else {
        tracing::info!(
            target: "sitebackup",
            event = "import_charset_undeclared",
            expected = %expected
        );
        return Ok(());
    };
    let declared = normalize_charset(declared);
    let expected = normalize_charset(expected);
    if declared == expected {
        return Ok(());
    }
    Err(AppError::of(
        ErrorKind::CharsetMismatch,
        "The dump charset does not match the configured charset",
    )
    .with_context("declared", declared)
    .with_context("expected", expected))
}
