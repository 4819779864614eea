#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::fs;
use std::sync::Arc;

use sitebackup_lib::config::EngineType;
use sitebackup_lib::db::statements::split_all;
use sitebackup_lib::fsutil::{file_sha256, partial_path};
use sitebackup_lib::notify::{Level, MemoryNotifier};
use sitebackup_lib::{BackupEngine, ErrorKind};
use tempfile::tempdir;

use util::{seed_shop, settings, MemoryServer};

#[tokio::test]
async fn export_writes_complete_dump() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    let engine = BackupEngine::new(settings(dir.path()), server.connector());

    let artifact = engine.export_database(Some("nightly")).await.unwrap();

    assert_eq!(artifact.name, "nightly.sql");
    assert_eq!(artifact.path, dir.path().join("MyFiles/Backups/nightly.sql"));
    assert_eq!(artifact.size_bytes, fs::metadata(&artifact.path).unwrap().len());
    assert_eq!(artifact.sha256, file_sha256(&artifact.path).unwrap());
    let rows: Vec<_> = artifact.tables.iter().map(|t| (t.name.as_str(), t.rows)).collect();
    assert_eq!(rows, [("clientes", 3), ("facturas", 2), ("adjuntos", 1)]);

    let text = fs::read_to_string(&artifact.path).unwrap();
    assert!(text.contains("-- Database: shop"));
    assert!(text.contains("SET FOREIGN_KEY_CHECKS=0;"));
    assert!(text.trim_end().contains("SET FOREIGN_KEY_CHECKS=1;"));
    let statements = split_all(&text).unwrap();
    let creates = statements.iter().filter(|s| s.starts_with("CREATE TABLE")).count();
    let drops = statements.iter().filter(|s| s.starts_with("DROP TABLE IF EXISTS")).count();
    assert_eq!((creates, drops), (3, 3));
    assert!(!partial_path(&artifact.path).exists());
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn failed_export_keeps_previous_dump() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    server.fail_stream("facturas");
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(settings(dir.path()), server.connector())
        .with_notifier(notifier.clone());

    let backups = dir.path().join("MyFiles/Backups");
    fs::create_dir_all(&backups).unwrap();
    let target = backups.join("nightly.sql");
    fs::write(&target, b"-- previous dump\n").unwrap();

    let err = engine.export_database(Some("nightly.sql")).await.unwrap_err();

    assert_eq!(err.code(), "MySql/2013");
    assert_eq!(fs::read(&target).unwrap(), b"-- previous dump\n");
    assert!(!partial_path(&target).exists());
    assert_eq!(notifier.keys(Level::Error), vec!["record-save-error"]);
}

#[tokio::test]
async fn empty_schema_is_rejected() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(settings(dir.path()), server.connector())
        .with_notifier(notifier.clone());

    let err = engine.export_database(None).await.unwrap_err();

    assert!(err.is(ErrorKind::EmptySchema));
    assert!(notifier.contains(Level::Error, "empty-database-error"));
    let leftovers: Vec<_> = fs::read_dir(dir.path().join("MyFiles/Backups"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn unsupported_engine_fails_before_any_io() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    let mut config = settings(dir.path());
    config.database.engine = EngineType::Postgresql;
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(config, server.connector()).with_notifier(notifier.clone());

    let err = engine.export_database(None).await.unwrap_err();

    assert!(err.is(ErrorKind::UnsupportedEngine));
    assert!(notifier.contains(Level::Error, "mysql-support-only"));
    assert!(!dir.path().join("MyFiles").exists());
    assert_eq!(server.connects(), 0);
}

#[tokio::test]
async fn missing_driver_fails_before_any_io() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(settings(dir.path()), server.connector())
        .with_notifier(notifier.clone())
        .with_driver_available(false);

    let err = engine.export_database(None).await.unwrap_err();

    assert!(err.is(ErrorKind::DriverMissing));
    assert!(notifier.contains(Level::Error, "pdo-mysql-support-only"));
    assert!(!dir.path().join("MyFiles").exists());
}

#[tokio::test]
async fn unusual_port_warns_but_exports() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    let mut config = settings(dir.path());
    config.database.port = 3307;
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(config, server.connector()).with_notifier(notifier.clone());

    engine.export_database(None).await.unwrap();

    let warning = notifier
        .messages()
        .into_iter()
        .find(|m| m.key == "backup-port-warning")
        .expect("port warning emitted");
    assert_eq!(warning.level, Level::Warning);
    assert_eq!(warning.param("%port%"), Some("3307"));
}

#[tokio::test]
async fn uncreatable_backup_directory_is_reported() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("MyFiles"), b"not a directory").unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(settings(dir.path()), server.connector())
        .with_notifier(notifier.clone());

    let err = engine.export_database(None).await.unwrap_err();

    assert!(err.is(ErrorKind::DirectoryCreate));
    assert!(notifier.contains(Level::Error, "folder-create-error"));
}

#[tokio::test]
async fn failed_rename_is_export_write_without_partial() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    let target = dir.path().join("MyFiles/Backups/nightly.sql");
    fs::create_dir_all(target.join("occupied")).unwrap();
    let engine = BackupEngine::new(settings(dir.path()), server.connector());

    let err = engine.export_database(Some("nightly")).await.unwrap_err();

    assert!(err.is(ErrorKind::ExportWrite));
    assert_eq!(err.code(), "BACKUP/EXPORT_WRITE");
    assert_eq!(err.context().get("operation").map(String::as_str), Some("finalize"));
    assert!(!partial_path(&target).exists());
    assert!(target.is_dir());
}

#[tokio::test]
async fn nameless_dump_gets_timestamp_name() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    let engine = BackupEngine::new(settings(dir.path()), server.connector());

    let artifact = engine.export_database(Some("..")).await.unwrap();

    assert_ne!(artifact.name, ".sql");
    assert!(sitebackup_lib::artifacts::timestamp_from_name(&artifact.name).is_some());
}
