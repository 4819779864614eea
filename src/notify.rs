//! Collaborator interfaces the engine reports through.
//!
//! The engine never formats user-facing text. It hands the host a message key
//! plus named placeholders (`%port%`, `%file%`) and lets the host's i18n layer
//! render it.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Notice,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub level: Level,
    pub key: String,
    pub params: Vec<(String, String)>,
}

impl Message {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub trait Notifier: Send + Sync {
    fn emit(&self, level: Level, key: &str, params: &[(&str, String)]);

    fn notice(&self, key: &str, params: &[(&str, String)]) {
        self.emit(Level::Notice, key, params);
    }

    fn warning(&self, key: &str, params: &[(&str, String)]) {
        self.emit(Level::Warning, key, params);
    }

    fn error(&self, key: &str, params: &[(&str, String)]) {
        self.emit(Level::Error, key, params);
    }
}

/// Forwards notifications to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn emit(&self, level: Level, key: &str, params: &[(&str, String)]) {
        let rendered = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            Level::Notice => {
                tracing::info!(target: "sitebackup", event = "notice", key, params = %rendered)
            }
            Level::Warning => {
                tracing::warn!(target: "sitebackup", event = "warning", key, params = %rendered)
            }
            Level::Error => {
                tracing::error!(target: "sitebackup", event = "error", key, params = %rendered)
            }
        }
    }
}

/// Keeps every message in memory so callers can inspect what was reported.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<Message>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn keys(&self, level: Level) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|message| message.level == level)
            .map(|message| message.key)
            .collect()
    }

    pub fn contains(&self, level: Level, key: &str) -> bool {
        self.messages()
            .iter()
            .any(|message| message.level == level && message.key == key)
    }
}

impl Notifier for MemoryNotifier {
    fn emit(&self, level: Level, key: &str, params: &[(&str, String)]) {
        let message = Message {
            level,
            key: key.to_string(),
            params: params
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        };
        self.messages
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(message);
    }
}

/// Drops derived state after the database has been replaced.
pub trait CacheInvalidator: Send + Sync {
    fn clear_all(&self);
}

/// Forces active sessions to re-authenticate after a restore.
pub trait SessionInvalidator: Send + Sync {
    fn clear_session_cookies(&self);
}

/// Cache invalidator that removes the application's on-disk cache folder.
#[derive(Debug, Clone)]
pub struct CacheDirInvalidator {
    pub dir: std::path::PathBuf,
}

impl CacheInvalidator for CacheDirInvalidator {
    fn clear_all(&self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                tracing::info!(target: "sitebackup", event = "cache_cleared", path = %self.dir.display());
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    target: "sitebackup",
                    event = "cache_clear_failed",
                    error = %err,
                    path = %self.dir.display()
                );
            }
        }
    }
}

/// Used where the host has no session layer (CLI, scheduled job).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSessions;

impl SessionInvalidator for NoSessions {
    fn clear_session_cookies(&self) {
        tracing::debug!(target: "sitebackup", event = "session_reset_skipped");
    }
}
