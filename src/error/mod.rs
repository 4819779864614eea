use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;
use zip::result::ZipError;

/// A structured error carrying a stable code plus diagnostic context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message; callers surface it through the notifier.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;
pub type Result<T> = AppResult<T>;

/// Failure classes raised by the backup engine.
///
/// Each kind owns a stable code so callers (CLI, job runner, tests) can
/// branch on the failure without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DriverMissing,
    UnsupportedEngine,
    DirectoryCreate,
    EmptySchema,
    ExportWrite,
    ArchiveOpen,
    ArchiveWrite,
    ArchiveExtract,
    CharsetMismatch,
    CharsetSwitch,
    ImportExec,
    FileNotFound,
    Connection,
}

impl ErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::DriverMissing => "BACKUP/DRIVER_MISSING",
            ErrorKind::UnsupportedEngine => "BACKUP/UNSUPPORTED_ENGINE",
            ErrorKind::DirectoryCreate => "BACKUP/DIRECTORY_CREATE",
            ErrorKind::EmptySchema => "BACKUP/EMPTY_SCHEMA",
            ErrorKind::ExportWrite => "BACKUP/EXPORT_WRITE",
            ErrorKind::ArchiveOpen => "BACKUP/ARCHIVE_OPEN",
            ErrorKind::ArchiveWrite => "BACKUP/ARCHIVE_WRITE",
            ErrorKind::ArchiveExtract => "BACKUP/ARCHIVE_EXTRACT",
            ErrorKind::CharsetMismatch => "BACKUP/CHARSET_MISMATCH",
            ErrorKind::CharsetSwitch => "BACKUP/CHARSET_SWITCH",
            ErrorKind::ImportExec => "BACKUP/IMPORT_EXEC",
            ErrorKind::FileNotFound => "BACKUP/FILE_NOT_FOUND",
            ErrorKind::Connection => "BACKUP/CONNECTION",
        }
    }

    /// Message key handed to the notifier when an operation fails with this kind.
    pub const fn message_key(self) -> &'static str {
        match self {
            ErrorKind::DriverMissing => "pdo-mysql-support-only",
            ErrorKind::UnsupportedEngine => "mysql-support-only",
            ErrorKind::DirectoryCreate => "folder-create-error",
            ErrorKind::EmptySchema => "empty-database-error",
            ErrorKind::CharsetMismatch => "charset-mismatch-error",
            ErrorKind::FileNotFound => "file-not-found",
            ErrorKind::Connection => "database-connection-error",
            ErrorKind::ExportWrite
            | ErrorKind::ArchiveOpen
            | ErrorKind::ArchiveWrite
            | ErrorKind::ArchiveExtract
            | ErrorKind::CharsetSwitch
            | ErrorKind::ImportExec => "record-save-error",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        const ALL: [ErrorKind; 13] = [
            ErrorKind::DriverMissing,
            ErrorKind::UnsupportedEngine,
            ErrorKind::DirectoryCreate,
            ErrorKind::EmptySchema,
            ErrorKind::ExportWrite,
            ErrorKind::ArchiveOpen,
            ErrorKind::ArchiveWrite,
            ErrorKind::ArchiveExtract,
            ErrorKind::CharsetMismatch,
            ErrorKind::CharsetSwitch,
            ErrorKind::ImportExec,
            ErrorKind::FileNotFound,
            ErrorKind::Connection,
        ];
        ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    /// Construct an error of one of the engine's failure classes.
    pub fn of(kind: ErrorKind, message: impl Into<String>) -> Self {
        AppError::new(kind.code(), message)
    }

    /// Returns the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the engine failure class, when the code belongs to one.
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(&self.code)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.code == kind.code()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the contextual metadata associated with the error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Returns the nested cause if one is present.
    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Extends the context map with additional key/value pairs.
    pub fn with_contexts<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// Re-labels an upstream failure as one of the engine's failure classes,
    /// keeping the original as the cause.
    pub fn reclassify(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        AppError::of(kind, message).with_cause(self)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("MySql/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

impl From<ZipError> for AppError {
    fn from(error: ZipError) -> Self {
        match error {
            ZipError::Io(err) => AppError::from(err).with_context("source", "zip"),
            ZipError::InvalidArchive(reason) => AppError::new("ZIP/INVALID_ARCHIVE", reason),
            ZipError::UnsupportedArchive(reason) => {
                AppError::new("ZIP/UNSUPPORTED_ARCHIVE", reason)
            }
            ZipError::FileNotFound => AppError::new("ZIP/FILE_NOT_FOUND", "Archive entry not found"),
            #[allow(unreachable_patterns)]
            other => AppError::new("ZIP/ERROR", other.to_string()),
        }
    }
}
