use std::path::Path;
use std::time::Duration;

use photogram_backup_core::clock::{format_day, local_today};
use photogram_backup_core::state_db::open_memory_state_db;
use photogram_backup_core::{
    AccountRecord, FolderSelection, FsMediaIndex, InMemoryAccountStore, InMemoryRemote,
    SyncConfig, SyncEngine, SyncLock, SyncOptions, SyncOutcome, SyncRequest,
};
use tempfile::TempDir;

fn write_file(path: &Path, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

async fn engine(
    media: &Path,
    lock: SyncLock,
    send_delay: Duration,
) -> SyncEngine<InMemoryRemote, InMemoryAccountStore, FsMediaIndex> {
    let mut folders = FolderSelection::new();
    folders.set(media.join("Camera"), true);
    let mut config = SyncConfig::new("uid-1", folders);
    config.upload_delay = Duration::from_millis(5);

    let accounts = InMemoryAccountStore::new();
    accounts
        .put(
            "uid-1",
            AccountRecord {
                status: Some("approved".to_string()),
                daily_limit: Some(0),
                usage_count: Some(0),
                last_sync_date: Some(format_day(local_today())),
            },
        )
        .await;

    SyncEngine::new(
        config,
        lock,
        open_memory_state_db().await.unwrap(),
        InMemoryRemote::with_send_delay(send_delay),
        accounts,
        FsMediaIndex::new(vec![media.to_path_buf()]),
    )
}

fn manual() -> SyncRequest {
    SyncRequest {
        is_manual: true,
        run_attempt: 0,
    }
}

#[tokio::test]
async fn concurrent_triggers_run_one_after_another() {
    let temp = TempDir::new().unwrap();
    let media = temp.path().join("media");
    for i in 0..3 {
        write_file(&media.join(format!("Camera/IMG_{i}.jpg")), b"img");
    }
    let engine = engine(&media, SyncLock::new(), Duration::from_millis(20)).await;

    let (first, second) = tokio::join!(
        engine.run(manual(), SyncOptions::default()),
        engine.run(manual(), SyncOptions::default())
    );

    let uploaded = [first, second]
        .into_iter()
        .map(|o| match o {
            SyncOutcome::Success(r) => r.uploaded_count,
            other => panic!("expected success, got {other:?}"),
        })
        .sum::<u64>();
    assert_eq!(uploaded, 3);
    assert_eq!(engine.remote().delivered().await.len(), 3);
    assert_eq!(engine.remote().max_in_flight(), 1);
    assert_eq!(engine.remote().topics_created(), 1);
    assert_eq!(engine.ledger().count().await.unwrap(), 3);
}

#[tokio::test]
async fn run_waits_while_the_host_holds_the_lock() {
    let temp = TempDir::new().unwrap();
    let media = temp.path().join("media");
    write_file(&media.join("Camera/IMG_0.jpg"), b"img");

    let lock = SyncLock::new();
    let engine = engine(&media, lock.clone(), Duration::ZERO).await;

    let guard = lock.acquire().await;
    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        engine.run(manual(), SyncOptions::default()),
    )
    .await;
    assert!(blocked.is_err(), "run should wait for the lock");
    drop(guard);

    let outcome = engine.run(manual(), SyncOptions::default()).await;
    assert!(matches!(outcome, SyncOutcome::Success(_)), "{outcome:?}");
    assert!(!lock.is_held());
}
