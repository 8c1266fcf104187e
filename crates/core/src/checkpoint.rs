use sqlx::{Row, SqlitePool};

use crate::{Error, Result};

const LAST_SYNC_KEY: &str = "last_sync_timestamp_ms";

/// Device-local lower bound for the next delta scan.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Milliseconds since epoch of the last completed sync, `0` if none.
    pub async fn last_sync_ms(&self) -> Result<i64> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?")
            .bind(LAST_SYNC_KEY)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(0);
        };
        let value: String = row.get("value");
        value.parse::<i64>().map_err(|_| Error::InvalidConfig {
            message: format!("corrupt {LAST_SYNC_KEY}: {value}"),
        })
    }

    pub async fn set_last_sync_ms(&self, ts_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(LAST_SYNC_KEY)
        .bind(ts_ms.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
