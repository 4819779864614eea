use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tempfile::NamedTempFile;

use crate::{AppError, AppResult, ErrorKind};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

static SET_TIME_ZONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*SET\s+time_zone\b").expect("valid time_zone pattern"));

/// The plain-text dump that the rest of the import reads. The file is
/// deleted when this value is dropped.
#[derive(Debug)]
pub struct NormalizedDump {
    file: NamedTempFile,
    pub was_compressed: bool,
    pub lines: u64,
    pub repaired_lines: u64,
}

impl NormalizedDump {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub fn is_gzip(path: &Path) -> AppResult<bool> {
    if path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("gz"))
    {
        return Ok(true);
    }
    let mut magic = [0_u8; 2];
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_dump")
            .with_context("path", path.display().to_string())
    })?;
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(magic == GZIP_MAGIC)
}

/// Produces a plain `.sql` copy of `source` inside `workdir`.
///
/// Gzip input is inflated on the fly. Every `SET time_zone ...` line is
/// guaranteed to end with `;` so it cannot swallow the next statement.
pub fn normalize(source: &Path, workdir: &Path) -> AppResult<NormalizedDump> {
    let compressed = is_gzip(source)?;
    let input = File::open(source).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_dump")
            .with_context("path", source.display().to_string())
    })?;
    let reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(input))
    } else {
        Box::new(input)
    };

    let file = tempfile::Builder::new()
        .prefix("import-")
        .suffix(".sql")
        .tempfile_in(workdir)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_normalized_dump")
                .with_context("path", workdir.display().to_string())
        })?;

    let (lines, repaired_lines) = rewrite_lines(BufReader::new(reader), file.as_file())
        .map_err(|err| {
            AppError::from(err)
                .reclassify(ErrorKind::ImportExec, "The dump could not be read")
                .with_context("path", source.display().to_string())
                .with_context("compressed", compressed.to_string())
        })?;

    tracing::info!(
        target: "sitebackup",
        event = "import_normalized",
        compressed,
        lines,
        repaired_lines
    );

    Ok(NormalizedDump {
        file,
        was_compressed: compressed,
        lines,
        repaired_lines,
    })
}

fn rewrite_lines<R: BufRead>(mut reader: R, out: &File) -> std::io::Result<(u64, u64)> {
    let mut writer = BufWriter::new(out);
    let mut line = Vec::new();
    let mut lines = 0_u64;
    let mut repaired = 0_u64;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        lines += 1;
        let body = trim_trailing_whitespace(&line);
        let (code, comment) = body.split_at(comment_start(body).unwrap_or(body.len()));
        let code = trim_trailing_whitespace(code);
        if SET_TIME_ZONE.is_match(code) && !code.ends_with(b";") {
            writer.write_all(code)?;
            writer.write_all(b";")?;
            if !comment.is_empty() {
                writer.write_all(b" ")?;
                writer.write_all(comment)?;
            }
            writer.write_all(b"\n")?;
            repaired += 1;
        } else {
            writer.write_all(&line)?;
        }
    }
    writer.flush()?;
    Ok((lines, repaired))
}

/// Offset of a trailing `-- ` or `#` comment that sits outside any quote.
fn comment_start(line: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < line.len() {
        let byte = line[i];
        match quote {
            Some(_) if byte == b'\\' => i += 1,
            Some(open) if byte == open => quote = None,
            Some(_) => {}
            None => match byte {
                b'\'' | b'"' | b'`' => quote = Some(byte),
                b'#' => return Some(i),
                b'-' if line[i..].starts_with(b"--")
                    && line.get(i + 2).map_or(true, |next| next.is_ascii_whitespace()) =>
                {
                    return Some(i)
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn trim_trailing_whitespace(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && line[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;

    #[test]
    fn terminates_time_zone_statements() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("dump.sql");
        fs::write(
            &source,
            "SET time_zone = '+00:00'\nSET NAMES utf8;\nset TIME_ZONE='Europe/Madrid';\r\nSELECT 1;\n",
        )
        .unwrap();

        let dump = normalize(&source, tmp.path()).unwrap();
        let text = fs::read_to_string(dump.path()).unwrap();
        assert!(!dump.was_compressed);
        assert_eq!(dump.repaired_lines, 1);
        assert_eq!(dump.lines, 4);
        assert!(text.starts_with("SET time_zone = '+00:00';\nSET NAMES utf8;\n"));
        assert!(text.contains("set TIME_ZONE='Europe/Madrid';\r\n"));
    }

    #[test]
    fn terminator_goes_before_trailing_comment() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("dump.sql");
        fs::write(
            &source,
            "SET time_zone='+00:00' -- utc\nSET time_zone = '#1' # hash\nSET time_zone='-01:00'; -- done\n",
        )
        .unwrap();

        let dump = normalize(&source, tmp.path()).unwrap();
        let text = fs::read_to_string(dump.path()).unwrap();
        assert_eq!(dump.repaired_lines, 2);
        assert_eq!(
            text,
            "SET time_zone='+00:00'; -- utc\nSET time_zone = '#1'; # hash\nSET time_zone='-01:00'; -- done\n"
        );
    }

    #[test]
    fn inflates_gzip_by_magic_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("upload.bin");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"CREATE TABLE t (id int);\n").unwrap();
        fs::write(&source, encoder.finish().unwrap()).unwrap();

        assert!(is_gzip(&source).unwrap());
        let dump = normalize(&source, tmp.path()).unwrap();
        assert!(dump.was_compressed);
        assert_eq!(
            fs::read_to_string(dump.path()).unwrap(),
            "CREATE TABLE t (id int);\n"
        );
    }

    #[test]
    fn normalized_file_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("dump.sql");
        fs::write(&source, "SELECT 1;\n").unwrap();
        let dump = normalize(&source, tmp.path()).unwrap();
        let path = dump.path().to_path_buf();
        assert!(path.exists());
        drop(dump);
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_gzip_is_reported_as_import_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("broken.sql.gz");
        fs::write(&source, [0x1f, 0x8b, 0x00, 0x01, 0x02]).unwrap();
        let err = normalize(&source, tmp.path()).unwrap_err();
        assert!(err.is(ErrorKind::ImportExec));
    }
}
