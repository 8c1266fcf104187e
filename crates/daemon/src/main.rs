use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use photogram_backup_core::config::{self as settings_config, Settings};
use photogram_backup_core::run_log::RunLog;
use photogram_backup_core::state_db::{open_state_db, state_db_path};
use photogram_backup_core::{
    FsMediaIndex, MarkerFileConnectivity, RealtimeDbAccountStore, SyncEngine, SyncLock,
    SyncOptions, SyncOutcome, SyncRequest, TelegramBotApi,
};
use sqlx::SqlitePool;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

mod scheduler;
mod shutdown;

use scheduler::Scheduler;

type DaemonEngine = SyncEngine<TelegramBotApi, RealtimeDbAccountStore, FsMediaIndex>;

const LOOP_TICK: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_root = settings_config::default_config_dir()?;
    let data_root = settings_config::default_data_dir(&config_root);
    let config_path = settings_config::config_path(&config_root);

    let mut settings = settings_config::load_settings(&config_root)?;
    let mut last_config_mtime = file_mtime(&config_path);

    photogram_backup_core::run_log::init_process_logging();

    let pool = open_state_db(&state_db_path(&data_root)).await?;
    let lock = SyncLock::new();
    let mut engine = build_engine(&settings, &pool, &lock, &data_root)?;

    let shutdown = shutdown::install_signal_handler()?;
    let manual_trigger_pending = Arc::new(AtomicBool::new(false));
    tokio::spawn(manual_trigger_watcher_loop(
        settings_config::sync_trigger_path(&data_root),
        manual_trigger_pending.clone(),
        shutdown.clone(),
    ));

    let mut schedule = Scheduler::new(settings.interval(), Instant::now());

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let mtime = file_mtime(&config_path);
        if mtime != last_config_mtime {
            last_config_mtime = mtime;
            match reload(&config_root, &pool, &lock, &data_root) {
                Ok((next_settings, next_engine)) => {
                    schedule.set_interval(next_settings.interval());
                    settings = next_settings;
                    engine = next_engine;
                }
                Err(e) => {
                    // Keep running with the last good settings.
                    tracing::warn!(
                        event = "config.reload_failed",
                        error = %e,
                        "config.reload_failed"
                    );
                }
            }
        }

        let manual_triggered = manual_trigger_pending.swap(false, Ordering::SeqCst);
        if manual_triggered || schedule.is_due(Instant::now()) {
            let request = schedule.next_request(manual_triggered);
            let outcome = run_once(&engine, request, &shutdown, &data_root).await?;
            schedule.record(request, &outcome, Instant::now());

            let wait = schedule.next_due().saturating_duration_since(Instant::now());
            let next_run_at = chrono::Local::now()
                + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
            tracing::info!(
                event = "schedule.next",
                attempt = schedule.attempt(),
                interval_minutes = settings.sync.interval_minutes,
                next_run_at = %next_run_at.to_rfc3339(),
                "schedule.next"
            );
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(LOOP_TICK) => {}
        }
    }

    pool.close().await;
    Ok(())
}

fn build_engine(
    settings: &Settings,
    pool: &SqlitePool,
    lock: &SyncLock,
    data_root: &Path,
) -> Result<DaemonEngine, Box<dyn std::error::Error>> {
    let remote = TelegramBotApi::new(settings.telegram_config())?;
    let accounts = RealtimeDbAccountStore::new(settings.account_store_config()?)?;
    let index = FsMediaIndex::new(settings.media_roots());

    Ok(SyncEngine::new(
        settings.sync_config(),
        lock.clone(),
        pool.clone(),
        remote,
        accounts,
        index,
    )
    .with_connectivity(MarkerFileConnectivity::new(
        settings_config::metered_marker_path(data_root),
    )))
}

fn reload(
    config_root: &Path,
    pool: &SqlitePool,
    lock: &SyncLock,
    data_root: &Path,
) -> Result<(Settings, DaemonEngine), Box<dyn std::error::Error>> {
    let settings = settings_config::load_settings(config_root)?;
    let engine = build_engine(&settings, pool, lock, data_root)?;
    tracing::info!(
        event = "config.reloaded",
        folders = settings.folder_selection().selected().count() as u64,
        interval_minutes = settings.sync.interval_minutes,
        "config.reloaded"
    );
    Ok((settings, engine))
}

async fn run_once(
    engine: &DaemonEngine,
    request: SyncRequest,
    shutdown: &CancellationToken,
    data_root: &Path,
) -> Result<SyncOutcome, Box<dyn std::error::Error>> {
    let run_log = RunLog::create(data_root, request)?;
    tracing::info!(
        event = "run.dispatch",
        run_id = run_log.run_id(),
        manual = request.is_manual,
        run_attempt = request.run_attempt,
        log_path = %run_log.path().display(),
        "run.dispatch"
    );

    let outcome = run_log
        .record(engine.run(
            request,
            SyncOptions {
                cancel: Some(shutdown),
                progress: None,
            },
        ))
        .await;

    tracing::info!(
        event = "run.done",
        run_id = run_log.run_id(),
        outcome = outcome.as_str(),
        "run.done"
    );
    Ok(outcome)
}

async fn manual_trigger_watcher_loop(
    path: PathBuf,
    pending: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let removed = tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                if !path.exists() {
                    return Ok(false);
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e),
                }
            }
        })
        .await;

        match removed {
            Ok(Ok(true)) => {
                pending.store(true, Ordering::SeqCst);
                tracing::info!(
                    event = "manual.trigger",
                    path = %path.display(),
                    "manual.trigger"
                );
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    event = "manual.trigger_remove_failed",
                    path = %path.display(),
                    error = %e,
                    "manual.trigger_remove_failed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    event = "manual.trigger_task_failed",
                    path = %path.display(),
                    error = %e,
                    "manual.trigger_task_failed"
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(Duration::from_millis(200)) => {}
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
