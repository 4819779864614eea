pub mod archive;
pub mod artifacts;
pub mod config;
pub mod cron;
pub mod db;
pub mod dump;
pub mod engine;
mod error;
pub mod fsutil;
pub mod guard;
pub mod import;
pub mod logging;
pub mod notify;

pub use config::Settings;
pub use engine::{Action, BackupEngine, Outcome};
pub use error::{AppError, AppResult, ErrorKind};
pub use logging::init_logging;
