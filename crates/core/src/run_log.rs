//! Per-run NDJSON logs.
//!
//! Each sync run gets its own file under `<data dir>/logs`. [`RunLog::record`] drives the run
//! future under a dedicated JSON subscriber, inside a `sync_run` span, so every line in the file
//! carries the run id, and the file opens with `run.start` and closes with `run.finish`.
//! Process-level events (scheduling, config reloads) go to stderr through
//! [`init_process_logging`].

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use chrono::Utc;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, info, info_span, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::sync::{SyncOutcome, SyncRequest};

pub const LOG_ENV: &str = "PHOTOGRAM_LOG";
pub const LOG_DIR_ENV: &str = "PHOTOGRAM_LOG_DIR";

static PROCESS_INIT: OnceLock<()> = OnceLock::new();

fn build_env_filter_from(photogram_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("debug");

    match photogram_log.or(rust_log) {
        Some(v) => EnvFilter::try_new(v).unwrap_or_else(|_| default()),
        None => default(),
    }
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the stderr subscriber for events outside any run. Safe to call more than once.
pub fn init_process_logging() {
    PROCESS_INIT.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init();
    });
}

/// Shared handle on the open run file.
#[derive(Clone)]
struct RunFile(Arc<Mutex<BufWriter<File>>>);

impl RunFile {
    fn lock(&self) -> MutexGuard<'_, BufWriter<File>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sync(&self) -> std::io::Result<()> {
        let mut writer = self.lock();
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

struct RunFileWriter<'a>(MutexGuard<'a, BufWriter<File>>);

impl Write for RunFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for RunFile {
    type Writer = RunFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunFileWriter(self.lock())
    }
}

pub struct RunLog {
    run_id: String,
    path: PathBuf,
    request: SyncRequest,
    file: RunFile,
    dispatch: Dispatch,
}

impl RunLog {
    /// Creates `<log dir>/run-sync-<utc>-<run id>.ndjson` with a fresh run id.
    pub fn create(data_dir: &Path, request: SyncRequest) -> std::io::Result<Self> {
        let run_id = format!("run_{}", Uuid::new_v4());
        let log_dir = resolve_log_dir(data_dir);
        std::fs::create_dir_all(&log_dir)?;

        let path = log_dir.join(run_log_file_name(&run_id, Utc::now()));
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        let file = RunFile(Arc::new(Mutex::new(BufWriter::new(file))));

        let subscriber = tracing_subscriber::registry().with(build_env_filter()).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(file.clone()),
        );

        Ok(Self {
            run_id,
            path,
            request,
            file,
            dispatch: Dispatch::new(subscriber),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drives `run` with every event it emits written to this log, bracketed by `run.start` and
    /// `run.finish`. The file is synced before returning.
    pub async fn record<F>(&self, run: F) -> SyncOutcome
    where
        F: Future<Output = SyncOutcome>,
    {
        let span = tracing::dispatcher::with_default(&self.dispatch, || {
            info_span!(
                "sync_run",
                run_id = %self.run_id,
                manual = self.request.is_manual,
                run_attempt = self.request.run_attempt
            )
        });

        let outcome = async {
            info!(
                event = "run.start",
                log_path = %self.path.display(),
                "run.start"
            );
            let started = Instant::now();
            let outcome = run.await;
            log_finish(&outcome, started.elapsed().as_secs_f64());
            outcome
        }
        .instrument(span)
        .with_subscriber(self.dispatch.clone())
        .await;

        if let Err(e) = self.file.sync() {
            warn!(
                event = "run_log.sync_failed",
                path = %self.path.display(),
                error = %e,
                "run_log.sync_failed"
            );
        }
        outcome
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        let _ = self.file.sync();
    }
}

fn log_finish(outcome: &SyncOutcome, duration_seconds: f64) {
    match outcome {
        SyncOutcome::Success(report) => info!(
            event = "run.finish",
            outcome = outcome.as_str(),
            duration_seconds,
            uploaded_count = report.uploaded_count,
            usage_count = report.usage_count,
            matched_count = report.matched_count,
            failed_count = report.failed_count,
            imported_count = report.imported_count,
            quota_exhausted = report.quota_exhausted,
            "run.finish"
        ),
        SyncOutcome::Retry { code, reason } | SyncOutcome::Failure { code, reason } => warn!(
            event = "run.finish",
            outcome = outcome.as_str(),
            duration_seconds,
            code = *code,
            reason = %reason,
            "run.finish"
        ),
    }
}

pub fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(v) = std::env::var(LOG_DIR_ENV) {
        return PathBuf::from(v);
    }
    data_dir.join("logs")
}

fn run_log_file_name(run_id: &str, started_at: chrono::DateTime<Utc>) -> String {
    let safe_id = run_id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect::<String>();
    format!(
        "run-sync-{}-{safe_id}.ndjson",
        started_at.format("%Y%m%dT%H%M%SZ")
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::sync::SyncReport;

    #[test]
    fn env_filter_precedence_is_photogram_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("info"), Some("debug"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);

        assert_eq!(f1.to_string(), "info");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "debug");
    }

    #[test]
    fn file_names_are_stamped_and_sanitized() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 5).unwrap();
        assert_eq!(
            run_log_file_name("run_a/b c", at),
            "run-sync-20260301T083005Z-run_a_b_c.ndjson"
        );
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn event_name(v: &serde_json::Value) -> Option<&str> {
        v.pointer("/fields/event").and_then(|e| e.as_str())
    }

    #[tokio::test]
    async fn every_line_of_a_run_carries_its_run_id() {
        let temp = tempfile::tempdir().unwrap();
        let request = SyncRequest {
            is_manual: true,
            run_attempt: 2,
        };
        let log = RunLog::create(temp.path(), request).unwrap();
        assert_eq!(log.path().parent(), Some(temp.path().join("logs").as_path()));

        let outcome = log
            .record(async {
                tracing::info!(event = "phase.start", phase = "scan", "phase.start");
                SyncOutcome::Success(SyncReport {
                    uploaded_count: 2,
                    usage_count: 7,
                    ..SyncReport::default()
                })
            })
            .await;
        assert_eq!(outcome.as_str(), "success");

        let lines = read_lines(log.path());
        let events = lines.iter().filter_map(event_name).collect::<Vec<_>>();
        assert_eq!(events, vec!["run.start", "phase.start", "run.finish"]);

        for line in &lines {
            assert_eq!(line["span"]["name"], "sync_run");
            assert_eq!(line["span"]["run_id"], log.run_id());
            assert_eq!(line["span"]["manual"], true);
            assert_eq!(line["span"]["run_attempt"], 2);
        }
        let finish = lines.last().unwrap();
        assert_eq!(finish["fields"]["uploaded_count"], 2);
        assert_eq!(finish["fields"]["usage_count"], 7);
    }

    #[tokio::test]
    async fn retry_outcomes_record_their_code() {
        let temp = tempfile::tempdir().unwrap();
        let log = RunLog::create(temp.path(), SyncRequest::default()).unwrap();

        log.record(async {
            SyncOutcome::Retry {
                code: "network.transient",
                reason: "connect timeout".to_string(),
            }
        })
        .await;

        let lines = read_lines(log.path());
        let finish = lines
            .iter()
            .find(|l| event_name(l) == Some("run.finish"))
            .unwrap();
        assert_eq!(finish["level"], "WARN");
        assert_eq!(finish["fields"]["outcome"], "retry");
        assert_eq!(finish["fields"]["code"], "network.transient");
    }

    #[tokio::test]
    async fn events_outside_the_run_stay_out_of_the_file() {
        let temp = tempfile::tempdir().unwrap();
        let log = RunLog::create(temp.path(), SyncRequest::default()).unwrap();

        tracing::info!(event = "schedule.next", "schedule.next");
        log.record(async { SyncOutcome::Success(SyncReport::default()) })
            .await;
        tracing::info!(event = "schedule.next", "schedule.next");

        let lines = read_lines(log.path());
        assert!(lines.iter().all(|l| event_name(l) != Some("schedule.next")));
    }
}
