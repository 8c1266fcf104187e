//! User-visible, append-only activity log bounded to the most recent entries.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::Result;
use crate::clock::now_unix_ms;

pub const MAX_ACTIVITY_ENTRIES: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub ts_ms: i64,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ActivityLog {
    pool: SqlitePool,
}

impl ActivityLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, level: Level, message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO activity_log (ts_ms, level, message) VALUES (?, ?, ?)")
            .bind(now_unix_ms())
            .bind(level.as_str())
            .bind(message)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            DELETE FROM activity_log
            WHERE id NOT IN (
              SELECT id FROM activity_log ORDER BY ts_ms DESC, id DESC LIMIT ?
            )
            "#,
        )
        .bind(MAX_ACTIVITY_ENTRIES)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Appends and swallows storage failures. The log must never break a sync run.
    pub async fn note(&self, level: Level, message: &str) {
        if let Err(e) = self.append(level, message).await {
            warn!(
                event = "activity_log.append_failed",
                error = %e,
                "activity_log.append_failed"
            );
        }
    }

    pub async fn recent(&self, limit: u32) -> Result<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT ts_ms, level, message
            FROM activity_log
            ORDER BY ts_ms DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ActivityEntry {
                ts_ms: row.get("ts_ms"),
                level: row.get("level"),
                message: row.get("message"),
            })
            .collect())
    }

    pub async fn clear(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM activity_log")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
