//! One end-to-end delta sync: access check, optional history import, scan and upload, then
//! persisting the ledger export and the checkpoint.
//!
//! Runs are single-flight through [`SyncLock`], which the host owns and may share between
//! engines. Every phase transition and error also lands in the activity log.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity_log::{ActivityLog, Level};
use crate::checkpoint::CheckpointStore;
use crate::clock::now_unix_ms;
use crate::ledger::{Ledger, export_json, parse_export_json};
use crate::progress::{ProgressSink, SyncProgress};
use crate::quota::{AccountStore, Gatekeeper};
use crate::registry::{RegistryClient, RegistryStore};
use crate::scanner::{CandidateFile, MediaIndex, scan};
use crate::selection::FolderSelection;
use crate::storage::MediaStorage;
use crate::upload::{download_history_snapshot, upload_file, upload_history_snapshot};
use crate::{Error, ErrorKind, Result};

pub const DEFAULT_UPLOAD_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Retry code of a scheduled run held back until the network is unmetered.
pub const METERED_DEFERRAL_CODE: &str = "network.metered";

/// Process-wide single-flight lock. Clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct SyncLock {
    inner: Arc<Mutex<()>>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for any run in progress to finish.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.inner.clone().lock_owned().await
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

pub trait Connectivity: Send + Sync {
    fn is_unmetered(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct StaticConnectivity(pub bool);

impl Connectivity for StaticConnectivity {
    fn is_unmetered(&self) -> bool {
        self.0
    }
}

/// Metered while the marker file exists.
#[derive(Debug, Clone)]
pub struct MarkerFileConnectivity {
    marker: PathBuf,
}

impl MarkerFileConnectivity {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Connectivity for MarkerFileConnectivity {
    fn is_unmetered(&self) -> bool {
        !self.marker.exists()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub account_id: String,
    pub folders: FolderSelection,
    pub only_unmetered: bool,
    pub upload_delay: Duration,
    pub max_attempts: u32,
    pub account_timeout: Duration,
}

impl SyncConfig {
    pub fn new(account_id: impl Into<String>, folders: FolderSelection) -> Self {
        Self {
            account_id: account_id.into(),
            folders,
            only_unmetered: false,
            upload_delay: DEFAULT_UPLOAD_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            account_timeout: Duration::from_secs(crate::quota::DEFAULT_ACCOUNT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRequest {
    pub is_manual: bool,
    /// Attempts already made for this job; 0 on the first run.
    pub run_attempt: u32,
}

#[derive(Default)]
pub struct SyncOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded_count: u64,
    pub usage_count: u32,
    pub matched_count: u64,
    pub failed_count: u64,
    pub imported_count: u64,
    pub quota_exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success(SyncReport),
    Retry { code: &'static str, reason: String },
    Failure { code: &'static str, reason: String },
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Retry { .. } => "retry",
            Self::Failure { .. } => "failure",
        }
    }

    /// The run never started because the network was metered; no attempt was spent.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Retry { code, .. } if *code == METERED_DEFERRAL_CODE)
    }
}

enum RunEnd {
    Completed(SyncReport),
    Deferred,
    Interrupted,
}

pub struct SyncEngine<R, A, I> {
    config: SyncConfig,
    lock: SyncLock,
    ledger: Ledger,
    checkpoint: CheckpointStore,
    activity: ActivityLog,
    registry: RegistryClient<R>,
    gatekeeper: Gatekeeper<A>,
    index: I,
    connectivity: Box<dyn Connectivity>,
}

impl<R, A, I> SyncEngine<R, A, I>
where
    R: MediaStorage + RegistryStore,
    A: AccountStore,
    I: MediaIndex,
{
    pub fn new(
        config: SyncConfig,
        lock: SyncLock,
        pool: SqlitePool,
        remote: R,
        accounts: A,
        index: I,
    ) -> Self {
        let gatekeeper = Gatekeeper::with_timeout(accounts, config.account_timeout);
        Self {
            config,
            lock,
            ledger: Ledger::new(pool.clone()),
            checkpoint: CheckpointStore::new(pool.clone()),
            activity: ActivityLog::new(pool),
            registry: RegistryClient::new(remote),
            gatekeeper,
            index,
            connectivity: Box::new(StaticConnectivity(true)),
        }
    }

    pub fn with_connectivity(mut self, connectivity: impl Connectivity + 'static) -> Self {
        self.connectivity = Box::new(connectivity);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn registry(&self) -> &RegistryClient<R> {
        &self.registry
    }

    pub fn remote(&self) -> &R {
        self.registry.store()
    }

    pub fn gatekeeper(&self) -> &Gatekeeper<A> {
        &self.gatekeeper
    }

    pub async fn run(&self, request: SyncRequest, options: SyncOptions<'_>) -> SyncOutcome {
        let _guard = self.lock.acquire().await;

        info!(
            event = "sync.start",
            manual = request.is_manual,
            run_attempt = request.run_attempt,
            "sync.start"
        );
        self.activity
            .note(
                Level::Info,
                &format!("Sync started (manual: {})", request.is_manual),
            )
            .await;

        let outcome = match self.run_locked(request, &options).await {
            Ok(RunEnd::Completed(report)) => {
                self.activity
                    .note(
                        Level::Info,
                        &format!("Sync finished: {} uploaded", report.uploaded_count),
                    )
                    .await;
                SyncOutcome::Success(report)
            }
            Ok(RunEnd::Deferred) => {
                self.activity
                    .note(Level::Info, "Sync deferred: waiting for unmetered network")
                    .await;
                SyncOutcome::Retry {
                    code: METERED_DEFERRAL_CODE,
                    reason: "waiting for unmetered network".to_string(),
                }
            }
            Ok(RunEnd::Interrupted) => {
                self.activity
                    .note(Level::Warn, "Sync interrupted; will retry")
                    .await;
                SyncOutcome::Retry {
                    code: Error::Cancelled.code(),
                    reason: "cancelled".to_string(),
                }
            }
            Err(e) => {
                self.activity
                    .note(Level::Error, &format!("Sync failed: {e}"))
                    .await;
                self.classify(e, request.run_attempt)
            }
        };

        match &outcome {
            SyncOutcome::Success(report) => info!(
                event = "sync.finish",
                outcome = outcome.as_str(),
                uploaded_count = report.uploaded_count,
                usage_count = report.usage_count,
                "sync.finish"
            ),
            SyncOutcome::Retry { code, reason } | SyncOutcome::Failure { code, reason } => warn!(
                event = "sync.finish",
                outcome = outcome.as_str(),
                code = *code,
                reason = %reason,
                "sync.finish"
            ),
        }
        outcome
    }

    fn classify(&self, e: Error, run_attempt: u32) -> SyncOutcome {
        let code = e.code();
        let reason = e.to_string();
        let retryable = match &e {
            Error::Cancelled => true,
            Error::AccessDenied { .. } | Error::RegistryTooLarge { .. } => false,
            other => other.kind() == ErrorKind::Transient && run_attempt < self.config.max_attempts,
        };
        if retryable {
            SyncOutcome::Retry { code, reason }
        } else {
            error!(event = "sync.failed", code, error = %e, "sync.failed");
            SyncOutcome::Failure { code, reason }
        }
    }

    async fn run_locked(&self, request: SyncRequest, options: &SyncOptions<'_>) -> Result<RunEnd> {
        if !request.is_manual && self.config.only_unmetered && !self.connectivity.is_unmetered() {
            debug!(event = "sync.deferred", "sync.deferred");
            return Ok(RunEnd::Deferred);
        }

        debug!(event = "phase.start", phase = "validating_access", "phase.start");
        let account = match self.gatekeeper.refresh(&self.config.account_id).await {
            Ok(account) => account,
            Err(Error::AccessDenied { status }) => {
                self.activity
                    .note(
                        Level::Error,
                        &format!("Access denied: account status is {status}"),
                    )
                    .await;
                return Err(Error::AccessDenied { status });
            }
            Err(e) => return Err(e),
        };
        debug!(
            event = "phase.finish",
            phase = "validating_access",
            status = account.status.as_str(),
            daily_limit = account.daily_limit,
            usage_count = account.usage_count,
            "phase.finish"
        );

        let mut report = SyncReport {
            usage_count: account.usage_count,
            ..SyncReport::default()
        };
        if account.quota_exhausted() {
            self.activity
                .note(
                    Level::Info,
                    &format!(
                        "Daily limit reached ({}/{}); nothing uploaded",
                        account.usage_count, account.daily_limit
                    ),
                )
                .await;
            report.quota_exhausted = true;
            return Ok(RunEnd::Completed(report));
        }

        let registry = self.registry.fetch().await?;
        if let Some(pointer) = registry.history_pointer()
            && self.ledger.count().await? == 0
        {
            report.imported_count = self.import_history(pointer).await?;
        }

        let since_secs = if request.is_manual {
            0
        } else {
            scan_lower_bound(self.checkpoint.last_sync_ms().await?)
        };
        let limited = account.is_limited();
        let daily_limit = account.daily_limit;

        // Files touched after this instant may be missing from the index snapshot.
        let scan_started_ms = now_unix_ms();
        let interrupted = self
            .scan_and_upload(since_secs, limited, daily_limit, &mut report, options)
            .await?;
        if interrupted {
            // Uploads already in the ledger must reach the remote history; the checkpoint stays.
            if report.uploaded_count > 0 {
                self.push_history().await?;
            }
            return Ok(RunEnd::Interrupted);
        }

        self.persist_state(report.uploaded_count, scan_started_ms, options)
            .await?;
        Ok(RunEnd::Completed(report))
    }

    async fn import_history(&self, pointer: &str) -> Result<u64> {
        debug!(event = "phase.start", phase = "importing_history", "phase.start");
        self.activity
            .note(Level::Info, "Importing history from remote...")
            .await;

        let json = download_history_snapshot(self.remote(), pointer).await?;
        let records = parse_export_json(&json)?;
        let imported = self.ledger.import_all(&records).await?;

        self.activity
            .note(Level::Info, &format!("Imported {imported} history records"))
            .await;
        debug!(
            event = "phase.finish",
            phase = "importing_history",
            records = records.len() as u64,
            imported,
            "phase.finish"
        );
        Ok(imported)
    }

    /// Returns `true` when the run was cancelled.
    async fn scan_and_upload(
        &self,
        since_secs: i64,
        limited: bool,
        daily_limit: u32,
        report: &mut SyncReport,
        options: &SyncOptions<'_>,
    ) -> Result<bool> {
        debug!(event = "phase.start", phase = "scan", since_secs, "phase.start");
        self.activity
            .note(Level::Debug, &format!("Scanning media since: {since_secs}"))
            .await;

        let mut seen = HashSet::new();
        let mut files_seen = 0u64;
        let mut interrupted = false;

        for file in scan(&self.index, since_secs).await? {
            if is_cancelled(options.cancel) {
                interrupted = true;
                break;
            }
            if limited && report.usage_count >= daily_limit {
                report.quota_exhausted = true;
                self.activity
                    .note(Level::Info, "Daily limit reached; stopping early")
                    .await;
                break;
            }
            if !seen.insert(file.path.clone()) {
                continue;
            }
            files_seen += 1;

            if !self.config.folders.is_selected(&file.parent_folder) {
                continue;
            }
            report.matched_count += 1;

            let path = file.path_str()?;
            if self.ledger.is_uploaded(path, file.modified_at).await? {
                continue;
            }

            emit_progress(options, "upload", files_seen, report, file.folder_name());

            match self.upload_one(&file).await {
                Ok(()) => {}
                Err(e @ Error::UploadFailed { .. }) => {
                    report.failed_count += 1;
                    warn!(
                        event = "sync.upload_failed",
                        path = %file.path.display(),
                        error = %e,
                        "sync.upload_failed"
                    );
                    self.activity
                        .note(
                            Level::Error,
                            &format!("Failed to upload: {}: {e}", file.file_name()),
                        )
                        .await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            self.ledger.mark_uploaded(path, file.modified_at).await?;
            report.uploaded_count += 1;
            if limited {
                report.usage_count += 1;
                self.gatekeeper
                    .record_usage(&self.config.account_id, report.usage_count)
                    .await;
            }
            self.activity
                .note(Level::Debug, &format!("Uploaded: {}", file.file_name()))
                .await;

            if self.pause_after_upload(options.cancel).await {
                interrupted = true;
                break;
            }
        }

        self.activity
            .note(
                Level::Debug,
                &format!(
                    "Scan result: {} in selected folders, {} new",
                    report.matched_count, report.uploaded_count
                ),
            )
            .await;
        debug!(
            event = "phase.finish",
            phase = "scan",
            files_seen,
            matched = report.matched_count,
            uploaded = report.uploaded_count,
            failed = report.failed_count,
            interrupted,
            "phase.finish"
        );
        emit_progress(options, "scan", files_seen, report, None);
        Ok(interrupted)
    }

    async fn upload_one(&self, file: &CandidateFile) -> Result<()> {
        let Some(folder_name) = file.folder_name() else {
            return Err(Error::UploadFailed {
                path: file.path.display().to_string(),
                message: "file has no named parent folder".to_string(),
            });
        };
        let destination_id = self.registry.resolve_destination(folder_name).await?;
        upload_file(self.remote(), file, &destination_id).await
    }

    /// Sleeps the inter-upload delay. Returns `true` if cancelled meanwhile.
    async fn pause_after_upload(&self, cancel: Option<&CancellationToken>) -> bool {
        let delay = self.config.upload_delay;
        match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            },
            None => {
                tokio::time::sleep(delay).await;
                false
            }
        }
    }

    async fn persist_state(
        &self,
        uploaded_count: u64,
        checkpoint_ms: i64,
        options: &SyncOptions<'_>,
    ) -> Result<()> {
        debug!(event = "phase.start", phase = "persisting_state", "phase.start");
        emit_progress(options, "persist", 0, &SyncReport::default(), None);

        let registry = self.registry.current().await?;
        let refresh_history = uploaded_count > 0 || registry.history_pointer().is_none();
        if refresh_history {
            self.push_history().await?;
        }

        self.checkpoint.set_last_sync_ms(checkpoint_ms).await?;
        debug!(
            event = "phase.finish",
            phase = "persisting_state",
            history_refreshed = refresh_history,
            checkpoint_ms,
            "phase.finish"
        );
        Ok(())
    }

    async fn push_history(&self) -> Result<()> {
        self.activity
            .note(Level::Debug, "Updating remote history...")
            .await;
        let records = self.ledger.export_all().await?;
        let json = export_json(&records)?;
        let file_id = upload_history_snapshot(self.remote(), json).await?;
        self.registry.set_history_pointer(&file_id).await?;
        debug!(
            event = "sync.history_pushed",
            records = records.len() as u64,
            file_id = %file_id,
            "sync.history_pushed"
        );
        Ok(())
    }
}

/// Scan bound for a scheduled run. Modification times have whole-second resolution, so the
/// checkpoint's own second is scanned again and the ledger drops the repeats.
fn scan_lower_bound(checkpoint_ms: i64) -> i64 {
    if checkpoint_ms <= 0 {
        return 0;
    }
    (checkpoint_ms.div_euclid(1000) - 1).max(0)
}

fn is_cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.is_some_and(CancellationToken::is_cancelled)
}

fn emit_progress(
    options: &SyncOptions<'_>,
    phase: &str,
    files_seen: u64,
    report: &SyncReport,
    current_folder: Option<&str>,
) {
    if let Some(sink) = options.progress {
        sink.on_progress(SyncProgress {
            phase: phase.to_string(),
            files_seen,
            files_uploaded: report.uploaded_count,
            files_skipped: report
                .matched_count
                .saturating_sub(report.uploaded_count + report.failed_count),
            files_failed: report.failed_count,
            current_folder: current_folder.map(str::to_string),
        });
    }
}
