#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::fs;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use sitebackup_lib::cron::{load_state, JobStatus};
use sitebackup_lib::notify::{Level, MemoryNotifier};
use sitebackup_lib::BackupEngine;
use tempfile::tempdir;

use util::{seed_shop, settings, MemoryServer};

#[tokio::test]
async fn weekly_job_writes_dump_and_archive_once_a_week() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("index.php"), b"<?php").unwrap();
    let server = MemoryServer::new();
    seed_shop(&server);
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(settings(dir.path()), server.connector())
        .with_notifier(notifier.clone());
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();

    let state = engine.run_scheduled(now, false).await.unwrap().expect("job ran");

    assert_eq!(state.status, JobStatus::Succeeded);
    assert_eq!(state.sql_file.as_deref(), Some("2024-03-01_02-00-00.sql"));
    assert_eq!(state.zip_file.as_deref(), Some("2024-03-01_02-00-00.zip"));
    let backups = dir.path().join("MyFiles/Backups");
    assert!(backups.join("2024-03-01_02-00-00.sql").is_file());
    assert!(backups.join("2024-03-01_02-00-00.zip").is_file());
    assert_eq!(load_state(&backups).unwrap(), Some(state));
    assert!(notifier.contains(Level::Notice, "backup-created"));

    let again = engine
        .run_scheduled(now + Duration::days(3), false)
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(server.connects(), 1);

    let forced = engine
        .run_scheduled(now + Duration::days(3), true)
        .await
        .unwrap();
    assert!(forced.is_some());
}

#[tokio::test]
async fn dump_failure_stops_the_job() {
    let dir = tempdir().unwrap();
    let server = MemoryServer::new();
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(settings(dir.path()), server.connector())
        .with_notifier(notifier.clone());
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();

    let state = engine.run_scheduled(now, false).await.unwrap().unwrap();

    assert_eq!(state.status, JobStatus::SqlFailed);
    assert_eq!(state.error_code.as_deref(), Some("BACKUP/EMPTY_SCHEMA"));
    assert_eq!(
        notifier.keys(Level::Error),
        vec!["empty-database-error", "sql-file-error"]
    );
    let zips = fs::read_dir(dir.path().join("MyFiles/Backups"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().map_or(false, |x| x == "zip"))
        .count();
    assert_eq!(zips, 0);
}

#[tokio::test]
async fn stale_dump_is_reported() {
    let dir = tempdir().unwrap();
    let backups = dir.path().join("MyFiles/Backups");
    fs::create_dir_all(&backups).unwrap();
    fs::write(backups.join("2024-01-01_00-00-00.sql"), b"-- dump").unwrap();
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = BackupEngine::new(settings(dir.path()), MemoryServer::new().connector())
        .with_notifier(notifier.clone());

    let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let stale = engine.check_stale_backup(now).unwrap().unwrap();

    assert_eq!(stale.days, 60);
    let message = notifier.messages().pop().unwrap();
    assert_eq!(message.key, "backup-db-outdated");
    assert_eq!(message.param("%days%"), Some("60"));
}
