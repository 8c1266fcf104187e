//! Account access and daily quota, sourced from a remote authoritative record.
//!
//! The remote record is shared by every device on the account. Day rollover is written back so
//! all devices converge on the same counter; usage increments are advisory and fire-and-forget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::{DAY_FORMAT, format_day, local_today};
use crate::storage::BoxFuture;
use crate::{Error, Result};

pub const DEFAULT_ACCOUNT_TIMEOUT_SECS: u64 = 10;
pub const NEVER_SYNCED: &str = "never";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Approved,
    Limited,
    Pending,
    Denied,
}

impl AccountStatus {
    /// Unknown or missing statuses are treated as not yet approved.
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(str::trim) {
            Some("approved") => Self::Approved,
            Some("limited") => Self::Limited,
            Some("denied") => Self::Denied,
            _ => Self::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Limited => "limited",
            Self::Pending => "pending",
            Self::Denied => "denied",
        }
    }

    pub fn has_access(self) -> bool {
        matches!(self, Self::Approved | Self::Limited)
    }
}

/// Remote record as stored, field names on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub daily_limit: Option<i64>,
    #[serde(default)]
    pub usage_count: Option<i64>,
    #[serde(default)]
    pub last_sync_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub status: AccountStatus,
    pub daily_limit: u32,
    pub usage_count: u32,
    pub last_reset_date: NaiveDate,
}

impl AccountState {
    pub fn is_limited(&self) -> bool {
        self.status == AccountStatus::Limited
    }

    pub fn quota_exhausted(&self) -> bool {
        self.is_limited() && self.usage_count >= self.daily_limit
    }
}

pub trait AccountStore {
    /// `Ok(None)` when no record exists for the account.
    fn fetch_account<'a>(&'a self, account_id: &'a str)
    -> BoxFuture<'a, Result<Option<AccountRecord>>>;

    fn write_usage<'a>(&'a self, account_id: &'a str, usage_count: u32)
    -> BoxFuture<'a, Result<()>>;

    /// Writes `usage_count = 0` and `last_sync_date = day` together.
    fn write_reset<'a>(&'a self, account_id: &'a str, day: &'a str) -> BoxFuture<'a, Result<()>>;
}

pub struct Gatekeeper<A> {
    store: A,
    timeout: Duration,
}

impl<A: AccountStore> Gatekeeper<A> {
    pub fn new(store: A) -> Self {
        Self::with_timeout(store, Duration::from_secs(DEFAULT_ACCOUNT_TIMEOUT_SECS))
    }

    pub fn with_timeout(store: A, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &A {
        &self.store
    }

    pub async fn refresh(&self, account_id: &str) -> Result<AccountState> {
        self.refresh_on(account_id, local_today()).await
    }

    /// Like [`Self::refresh`] with an explicit "today".
    pub async fn refresh_on(&self, account_id: &str, today: NaiveDate) -> Result<AccountState> {
        match tokio::time::timeout(self.timeout, self.refresh_inner(account_id, today)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Network {
                message: format!(
                    "account refresh timed out after {}s",
                    self.timeout.as_secs_f64()
                ),
            }),
        }
    }

    async fn refresh_inner(&self, account_id: &str, today: NaiveDate) -> Result<AccountState> {
        let Some(record) = self.store.fetch_account(account_id).await? else {
            return Err(Error::AccessDenied {
                status: "missing".to_string(),
            });
        };

        let status = AccountStatus::parse(record.status.as_deref());
        if !status.has_access() {
            return Err(Error::AccessDenied {
                status: status.as_str().to_string(),
            });
        }

        let daily_limit = clamp_u32(record.daily_limit);
        let mut usage_count = clamp_u32(record.usage_count);

        let last_reset = record
            .last_sync_date
            .as_deref()
            .filter(|d| *d != NEVER_SYNCED)
            .and_then(|d| NaiveDate::parse_from_str(d, DAY_FORMAT).ok());
        if last_reset != Some(today) {
            let day = format_day(today);
            self.store.write_reset(account_id, &day).await?;
            info!(
                event = "quota.day_rollover",
                previous_usage = usage_count,
                previous_date = record.last_sync_date.as_deref().unwrap_or(NEVER_SYNCED),
                today = %day,
                "quota.day_rollover"
            );
            usage_count = 0;
        }

        Ok(AccountState {
            status,
            daily_limit,
            usage_count,
            last_reset_date: today,
        })
    }

    /// Fire-and-forget: a failed write under-counts by one, which never blocks the user.
    pub async fn record_usage(&self, account_id: &str, usage_count: u32) {
        let write = self.store.write_usage(account_id, usage_count);
        let res = match tokio::time::timeout(self.timeout, write).await {
            Ok(res) => res,
            Err(_) => Err(Error::Network {
                message: "usage write timed out".to_string(),
            }),
        };
        if let Err(e) = res {
            warn!(
                event = "quota.record_usage_failed",
                usage_count,
                error = %e,
                "quota.record_usage_failed"
            );
        }
    }
}

fn clamp_u32(v: Option<i64>) -> u32 {
    v.unwrap_or(0).clamp(0, i64::from(u32::MAX)) as u32
}

#[derive(Debug, Clone)]
pub struct RealtimeDbConfig {
    /// Base URL of the realtime database, e.g. `https://<project>.firebasedatabase.app`.
    pub database_url: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

/// Account records under `users/<account_id>` in a realtime-database style REST store.
pub struct RealtimeDbAccountStore {
    config: RealtimeDbConfig,
    client: reqwest::Client,
}

impl RealtimeDbAccountStore {
    pub fn new(config: RealtimeDbConfig) -> Result<Self> {
        if config.database_url.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "account.database_url is empty".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self { config, client })
    }

    fn url(&self, account_id: &str, field: Option<&str>) -> String {
        let base = self.config.database_url.trim_end_matches('/');
        match field {
            Some(f) => format!("{base}/users/{account_id}/{f}.json"),
            None => format!("{base}/users/{account_id}.json"),
        }
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.auth_token.as_deref() {
            Some(token) if !token.is_empty() => request.query(&[("auth", token)]),
            _ => request,
        }
    }

    async fn execute(&self, what: &str, request: reqwest::RequestBuilder) -> Result<String> {
        let res = self.with_auth(request).send().await.map_err(|e| {
            if e.is_status() {
                Error::AccountStore {
                    message: format!("{what}: {e}"),
                }
            } else {
                Error::Network {
                    message: format!("{what}: {e}"),
                }
            }
        })?;
        let status = res.status();
        let body = res.text().await.map_err(|e| Error::Network {
            message: format!("{what} read response failed: {e}"),
        })?;
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Network {
                message: format!("{what} http {status}"),
            });
        }
        if !status.is_success() {
            return Err(Error::AccountStore {
                message: format!("{what} http {status}: {body}"),
            });
        }
        Ok(body)
    }
}

impl AccountStore for RealtimeDbAccountStore {
    fn fetch_account<'a>(
        &'a self,
        account_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<AccountRecord>>> {
        Box::pin(async move {
            let request = self.client.get(self.url(account_id, None));
            let body = self.execute("account fetch", request).await?;
            let record: Option<AccountRecord> =
                serde_json::from_str(&body).map_err(|e| Error::AccountStore {
                    message: format!("account record invalid: {e}"),
                })?;
            Ok(record)
        })
    }

    fn write_usage<'a>(
        &'a self,
        account_id: &'a str,
        usage_count: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let request = self
                .client
                .put(self.url(account_id, Some("usage_count")))
                .json(&usage_count);
            self.execute("usage write", request).await?;
            Ok(())
        })
    }

    fn write_reset<'a>(&'a self, account_id: &'a str, day: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let request = self
                .client
                .patch(self.url(account_id, None))
                .json(&serde_json::json!({ "usage_count": 0, "last_sync_date": day }));
            self.execute("usage reset", request).await?;
            Ok(())
        })
    }
}

/// Test double keyed by account id.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    records: Mutex<HashMap<String, AccountRecord>>,
    offline: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
    usage_writes: AtomicUsize,
    reset_writes: AtomicUsize,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, account_id: &str, record: AccountRecord) {
        self.records
            .lock()
            .await
            .insert(account_id.to_string(), record);
    }

    pub async fn get(&self, account_id: &str) -> Option<AccountRecord> {
        self.records.lock().await.get(account_id).cloned()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().await = Some(delay);
    }

    pub fn usage_writes(&self) -> usize {
        self.usage_writes.load(Ordering::SeqCst)
    }

    pub fn reset_writes(&self) -> usize {
        self.reset_writes.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network {
                message: "name resolution failed".to_string(),
            });
        }
        Ok(())
    }
}

impl AccountStore for InMemoryAccountStore {
    fn fetch_account<'a>(
        &'a self,
        account_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<AccountRecord>>> {
        Box::pin(async move {
            let delay = *self.fetch_delay.lock().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.check_online()?;
            Ok(self.records.lock().await.get(account_id).cloned())
        })
    }

    fn write_usage<'a>(
        &'a self,
        account_id: &'a str,
        usage_count: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_online()?;
            self.records
                .lock()
                .await
                .entry(account_id.to_string())
                .or_default()
                .usage_count = Some(i64::from(usage_count));
            self.usage_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn write_reset<'a>(&'a self, account_id: &'a str, day: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_online()?;
            let mut records = self.records.lock().await;
            let record = records.entry(account_id.to_string()).or_default();
            record.usage_count = Some(0);
            record.last_sync_date = Some(day.to_string());
            self.reset_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DAY_FORMAT).unwrap()
    }

    fn record(status: &str, limit: i64, usage: i64, last: &str) -> AccountRecord {
        AccountRecord {
            status: Some(status.to_string()),
            daily_limit: Some(limit),
            usage_count: Some(usage),
            last_sync_date: Some(last.to_string()),
        }
    }

    #[tokio::test]
    async fn rollover_resets_usage_and_writes_today() {
        let store = InMemoryAccountStore::new();
        store.put("u1", record("limited", 5, 5, "2026-10-18")).await;
        let gate = Gatekeeper::new(store);

        let state = gate.refresh_on("u1", day("2026-10-19")).await.unwrap();
        assert_eq!(state.usage_count, 0);
        assert_eq!(state.daily_limit, 5);
        assert!(!state.quota_exhausted());

        let stored = gate.store().get("u1").await.unwrap();
        assert_eq!(stored.usage_count, Some(0));
        assert_eq!(stored.last_sync_date.as_deref(), Some("2026-10-19"));
        assert_eq!(gate.store().reset_writes(), 1);
    }

    #[tokio::test]
    async fn never_synced_sentinel_counts_as_rollover() {
        let store = InMemoryAccountStore::new();
        store.put("u1", record("approved", 0, 17, NEVER_SYNCED)).await;
        let gate = Gatekeeper::new(store);

        let state = gate.refresh_on("u1", day("2026-10-19")).await.unwrap();
        assert_eq!(state.usage_count, 0);
        assert_eq!(gate.store().reset_writes(), 1);
    }

    #[tokio::test]
    async fn same_day_keeps_usage_without_writing() {
        let store = InMemoryAccountStore::new();
        store.put("u1", record("limited", 5, 5, "2026-10-19")).await;
        let gate = Gatekeeper::new(store);

        let state = gate.refresh_on("u1", day("2026-10-19")).await.unwrap();
        assert_eq!(state.usage_count, 5);
        assert!(state.quota_exhausted());
        assert_eq!(gate.store().reset_writes(), 0);
    }

    #[tokio::test]
    async fn only_approved_and_limited_have_access() {
        for status in ["pending", "denied", "weird"] {
            let store = InMemoryAccountStore::new();
            store.put("u1", record(status, 5, 0, "2026-10-19")).await;
            let gate = Gatekeeper::new(store);
            let err = gate.refresh_on("u1", day("2026-10-19")).await.unwrap_err();
            assert!(matches!(err, Error::AccessDenied { .. }), "{status}");
        }

        let gate = Gatekeeper::new(InMemoryAccountStore::new());
        let err = gate.refresh_on("nobody", day("2026-10-19")).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn slow_store_times_out_as_network_error() {
        let store = InMemoryAccountStore::new();
        store.put("u1", record("approved", 0, 0, "2026-10-19")).await;
        store.set_fetch_delay(Duration::from_millis(200)).await;
        let gate = Gatekeeper::with_timeout(store, Duration::from_millis(20));

        let err = gate.refresh_on("u1", day("2026-10-19")).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }

    #[tokio::test]
    async fn usage_write_failures_are_swallowed() {
        let store = InMemoryAccountStore::new();
        store.set_offline(true);
        let gate = Gatekeeper::new(store);

        gate.record_usage("u1", 3).await;
        assert_eq!(gate.store().usage_writes(), 0);
    }

    #[test]
    fn record_uses_wire_field_names() {
        let rec: AccountRecord = serde_json::from_str(
            r#"{"status":"limited","daily_limit":5,"usage_count":2,"last_sync_date":"never"}"#,
        )
        .unwrap();
        assert_eq!(rec.status.as_deref(), Some("limited"));
        assert_eq!(rec.daily_limit, Some(5));
        assert_eq!(rec.last_sync_date.as_deref(), Some(NEVER_SYNCED));
    }
}
