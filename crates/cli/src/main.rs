use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use photogram_backup_core::config::{self as settings_config, Settings};
use photogram_backup_core::ledger::{export_json, parse_export_json};
use photogram_backup_core::progress::{ProgressSink, SyncProgress};
use photogram_backup_core::run_log::RunLog;
use photogram_backup_core::state_db::{open_state_db, state_db_path};
use photogram_backup_core::{
    APP_NAME, ActivityLog, ErrorKind, FsMediaIndex, Ledger, MarkerFileConnectivity,
    RealtimeDbAccountStore, RegistryStore, SyncEngine, SyncLock, SyncOptions, SyncOutcome,
    SyncRequest, TelegramBotApi,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "photogram")]
#[command(about = "Photogram backup CLI", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Emit NDJSON progress events on stdout during a sync.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Sync {
        #[command(subcommand)]
        cmd: SyncCmd,
    },
    Folders {
        #[command(subcommand)]
        cmd: FoldersCmd,
    },
    History {
        #[command(subcommand)]
        cmd: HistoryCmd,
    },
    Logs {
        #[command(subcommand)]
        cmd: LogsCmd,
    },
    Registry {
        #[command(subcommand)]
        cmd: RegistryCmd,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SyncCmd {
    /// Run one sync in this process.
    Run {
        /// Rescan everything instead of starting from the checkpoint.
        #[arg(long)]
        manual: bool,
    },
    /// Ask a running daemon for a manual sync.
    Trigger,
}

#[derive(Subcommand)]
enum FoldersCmd {
    List,
    Add { path: PathBuf },
    Remove { path: PathBuf },
}

#[derive(Subcommand)]
enum HistoryCmd {
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Import {
        file: PathBuf,
    },
    Stats,
    Clear,
}

#[derive(Subcommand)]
enum LogsCmd {
    List {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    Clear,
}

#[derive(Subcommand)]
enum RegistryCmd {
    Show,
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

impl From<photogram_backup_core::Error> for CliError {
    fn from(e: photogram_backup_core::Error) -> Self {
        let code = e.code();
        match e.kind() {
            ErrorKind::Transient => Self::retryable(code, e.to_string()),
            ErrorKind::Permanent => Self::new(code, e.to_string()),
        }
    }
}

struct NdjsonProgressSink {
    run_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: SyncProgress) {
        let line = serde_json::json!({
            "type": "sync.progress",
            "runId": self.run_id,
            "phase": p.phase,
            "filesSeen": p.files_seen,
            "filesUploaded": p.files_uploaded,
            "filesSkipped": p.files_skipped,
            "filesFailed": p.files_failed,
            "currentFolder": p.current_folder,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => settings_config::default_config_dir()?,
    };
    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| settings_config::default_data_dir(&config_dir));

    match cli.cmd {
        Command::Sync { cmd } => match cmd {
            SyncCmd::Run { manual } => {
                sync_run(&config_dir, &data_dir, manual, cli.json, cli.events).await
            }
            SyncCmd::Trigger => sync_trigger(&data_dir, cli.json),
        },
        Command::Folders { cmd } => match cmd {
            FoldersCmd::List => folders_list(&config_dir, cli.json),
            FoldersCmd::Add { path } => folders_edit(&config_dir, &path, true, cli.json),
            FoldersCmd::Remove { path } => folders_edit(&config_dir, &path, false, cli.json),
        },
        Command::History { cmd } => match cmd {
            HistoryCmd::Export { out } => {
                history_export(&data_dir, out.as_deref(), cli.json).await
            }
            HistoryCmd::Import { file } => history_import(&data_dir, &file, cli.json).await,
            HistoryCmd::Stats => history_stats(&data_dir, cli.json).await,
            HistoryCmd::Clear => history_clear(&data_dir, cli.json).await,
        },
        Command::Logs { cmd } => match cmd {
            LogsCmd::List { limit } => logs_list(&data_dir, limit, cli.json).await,
            LogsCmd::Clear => logs_clear(&data_dir, cli.json).await,
        },
        Command::Registry { cmd } => match cmd {
            RegistryCmd::Show => registry_show(&config_dir, cli.json).await,
        },
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
        },
    }
}

async fn sync_run(
    config_dir: &Path,
    data_dir: &Path,
    manual: bool,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let settings = settings_config::load_settings(config_dir)?;
    let pool = open_state_db(&state_db_path(data_dir)).await?;

    let remote = TelegramBotApi::new(settings.telegram_config())?;
    let accounts = RealtimeDbAccountStore::new(settings.account_store_config()?)?;
    let engine = SyncEngine::new(
        settings.sync_config(),
        SyncLock::new(),
        pool.clone(),
        remote,
        accounts,
        FsMediaIndex::new(settings.media_roots()),
    )
    .with_connectivity(MarkerFileConnectivity::new(
        settings_config::metered_marker_path(data_dir),
    ));

    let request = SyncRequest {
        is_manual: manual,
        run_attempt: 0,
    };
    let run_log = RunLog::create(data_dir, request)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;
    let run_id = run_log.run_id().to_string();

    let sink = NdjsonProgressSink {
        run_id: run_id.clone(),
    };
    let outcome = run_log
        .record(engine.run(
            request,
            SyncOptions {
                cancel: None,
                progress: events.then_some(&sink as &dyn ProgressSink),
            },
        ))
        .await;
    drop(run_log);
    pool.close().await;

    match outcome {
        SyncOutcome::Success(report) => {
            if json || events {
                println!(
                    "{}",
                    serde_json::json!({
                        "type": "sync.finished",
                        "runId": run_id,
                        "uploadedCount": report.uploaded_count,
                        "usageCount": report.usage_count,
                        "importedCount": report.imported_count,
                        "failedCount": report.failed_count,
                        "quotaExhausted": report.quota_exhausted,
                    })
                );
            } else {
                println!(
                    "{APP_NAME}: {} uploaded, usage {}{}",
                    report.uploaded_count,
                    report.usage_count,
                    if report.quota_exhausted {
                        " (daily limit reached)"
                    } else {
                        ""
                    }
                );
            }
            Ok(())
        }
        SyncOutcome::Retry { code, reason } => Err(CliError::retryable(code, reason)),
        SyncOutcome::Failure { code, reason } => Err(CliError::new(code, reason)),
    }
}

fn sync_trigger(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let path = settings_config::sync_trigger_path(data_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CliError::new("control.write_failed", e.to_string()))?;
    }
    std::fs::write(&path, b"")
        .map_err(|e| CliError::new("control.write_failed", e.to_string()))?;
    if json {
        println!(
            "{}",
            serde_json::json!({ "triggered": true, "path": path.display().to_string() })
        );
    } else {
        println!("sync requested: {}", path.display());
    }
    Ok(())
}

fn folders_list(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = settings_config::load_settings_file(config_dir)?;
    if json {
        let folders = settings
            .folders
            .iter()
            .map(|(path, on)| serde_json::json!({ "path": path, "selected": on }))
            .collect::<Vec<_>>();
        println!("{}", serde_json::json!({ "folders": folders }));
    } else {
        for (path, on) in &settings.folders {
            println!("{} {path}", if *on { "[x]" } else { "[ ]" });
        }
    }
    Ok(())
}

fn folders_edit(config_dir: &Path, path: &Path, add: bool, json: bool) -> Result<(), CliError> {
    let mut settings = settings_config::load_settings_file(config_dir)?;
    let changed = if add {
        settings.set_folder(path, true)?;
        true
    } else {
        settings.remove_folder(path)?
    };
    settings_config::save_settings(config_dir, &settings)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "path": path.display().to_string(),
                "selected": add,
                "changed": changed,
            })
        );
    } else if add {
        println!("selected: {}", path.display());
    } else if changed {
        println!("removed: {}", path.display());
    } else {
        println!("not selected: {}", path.display());
    }
    Ok(())
}

async fn open_ledger(data_dir: &Path) -> Result<Ledger, CliError> {
    let pool = open_state_db(&state_db_path(data_dir)).await?;
    Ok(Ledger::new(pool))
}

async fn history_export(data_dir: &Path, out: Option<&Path>, json: bool) -> Result<(), CliError> {
    let ledger = open_ledger(data_dir).await?;
    let records = ledger.export_all().await?;
    let text = export_json(&records)?;

    match out {
        Some(path) => {
            std::fs::write(path, text.as_bytes())
                .map_err(|e| CliError::new("history.write_failed", e.to_string()))?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "exported": records.len(),
                        "path": path.display().to_string(),
                    })
                );
            } else {
                println!("exported {} records to {}", records.len(), path.display());
            }
        }
        None => println!("{text}"),
    }
    Ok(())
}

async fn history_import(data_dir: &Path, file: &Path, json: bool) -> Result<(), CliError> {
    let text = std::fs::read_to_string(file)
        .map_err(|e| CliError::new("history.read_failed", e.to_string()))?;
    let records = parse_export_json(&text)?;
    let ledger = open_ledger(data_dir).await?;
    let imported = ledger.import_all(&records).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "records": records.len(), "imported": imported })
        );
    } else {
        println!("imported {imported} of {} records", records.len());
    }
    Ok(())
}

async fn history_stats(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let ledger = open_ledger(data_dir).await?;
    let stats = ledger.stats().await?;
    if json {
        println!(
            "{}",
            serde_json::to_string(&stats).map_err(|e| CliError::new("json.encode", e.to_string()))?
        );
    } else {
        println!("totalFiles={}", stats.total_files);
        if let Some(first) = stats.first_upload_at {
            println!("firstUploadAt={first}");
        }
        if let Some(last) = stats.last_upload_at {
            println!("lastUploadAt={last}");
        }
    }
    Ok(())
}

async fn history_clear(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let ledger = open_ledger(data_dir).await?;
    let removed = ledger.clear().await?;
    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("removed {removed} records");
    }
    Ok(())
}

async fn logs_list(data_dir: &Path, limit: u32, json: bool) -> Result<(), CliError> {
    let pool = open_state_db(&state_db_path(data_dir)).await?;
    let entries = ActivityLog::new(pool).recent(limit).await?;
    if json {
        println!("{}", serde_json::json!({ "entries": entries }));
    } else {
        for e in &entries {
            println!("{} {:<5} {}", e.ts_ms, e.level, e.message);
        }
    }
    Ok(())
}

async fn logs_clear(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let pool = open_state_db(&state_db_path(data_dir)).await?;
    let removed = ActivityLog::new(pool).clear().await?;
    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("removed {removed} entries");
    }
    Ok(())
}

async fn registry_show(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = settings_config::load_settings(config_dir)?;
    let remote = TelegramBotApi::new(settings.telegram_config())?;
    let registry = remote.fetch_registry().await?;

    if json {
        let folders = registry
            .folders()
            .map(|(name, id)| serde_json::json!({ "folder": name, "destinationId": id }))
            .collect::<Vec<_>>();
        println!(
            "{}",
            serde_json::json!({
                "folders": folders,
                "historyPointer": registry.history_pointer(),
            })
        );
    } else {
        for (name, id) in registry.folders() {
            println!("{name} -> {id}");
        }
        match registry.history_pointer() {
            Some(p) => println!("history -> {p}"),
            None => println!("history -> (none)"),
        }
    }
    Ok(())
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut settings = settings_config::load_settings(config_dir)?;
    let token_present = !settings.telegram.bot_token.trim().is_empty();
    redact(&mut settings);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "settings": settings,
                "telegramBotTokenPresent": token_present,
            })
        );
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("telegramBotTokenPresent={token_present}");
    }
    Ok(())
}

fn redact(settings: &mut Settings) {
    if !settings.telegram.bot_token.is_empty() {
        settings.telegram.bot_token = "<redacted>".to_string();
    }
    if settings.account.auth_token.is_some() {
        settings.account.auth_token = Some("<redacted>".to_string());
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}"
            .to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
