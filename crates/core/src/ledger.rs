//! Durable record of which `(path, mtime)` pairs have been uploaded.
//!
//! Records are keyed by the pair, so editing a file (new mtime) makes it uploadable again while
//! re-marking an unchanged file is a no-op. The portable export is a JSON array of
//! `{"p": path, "m": mtime, "u": uploaded_at}` objects.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::Result;
use crate::clock::now_unix_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub path: String,
    /// Seconds since epoch, as reported by the media index.
    pub last_modified: i64,
    /// Milliseconds since epoch.
    pub uploaded_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub total_files: u64,
    pub first_upload_at: Option<i64>,
    pub last_upload_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InterchangeEntry {
    p: String,
    m: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    u: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn is_uploaded(&self, path: &str, last_modified: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present
            FROM uploads
            WHERE path = ? AND last_modified = ?
            LIMIT 1
            "#,
        )
        .bind(path)
        .bind(last_modified)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn mark_uploaded(&self, path: &str, last_modified: i64) -> Result<()> {
        let inserted = insert_if_absent(&self.pool, path, last_modified, now_unix_ms()).await?;
        if !inserted {
            debug!(
                event = "ledger.mark_duplicate",
                path,
                last_modified,
                "ledger.mark_duplicate"
            );
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM uploads")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(n.max(0) as u64)
    }

    /// Every record, most recent upload first.
    pub async fn export_all(&self) -> Result<Vec<UploadRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT path, last_modified, uploaded_at
            FROM uploads
            ORDER BY uploaded_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UploadRecord {
                path: row.get("path"),
                last_modified: row.get("last_modified"),
                uploaded_at: row.get("uploaded_at"),
            })
            .collect())
    }

    /// Inserts records that are not already present. Existing records are never overwritten, so
    /// running the same import twice adds nothing the second time.
    pub async fn import_all(&self, records: &[UploadRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut imported = 0u64;
        for record in records {
            let res = sqlx::query(
                r#"
                INSERT OR IGNORE INTO uploads (path, last_modified, uploaded_at)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(&record.path)
            .bind(record.last_modified)
            .bind(record.uploaded_at)
            .execute(&mut *tx)
            .await?;
            imported += res.rows_affected();
        }
        tx.commit().await?;

        info!(
            event = "ledger.import",
            offered = records.len() as u64,
            imported,
            "ledger.import"
        );
        Ok(imported)
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n, MIN(uploaded_at) AS first_at, MAX(uploaded_at) AS last_at
            FROM uploads
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(LedgerStats {
            total_files: n.max(0) as u64,
            first_upload_at: row.get("first_at"),
            last_upload_at: row.get("last_at"),
        })
    }

    pub async fn clear(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM uploads")
            .execute(&self.pool)
            .await?;
        info!(
            event = "ledger.clear",
            deleted = res.rows_affected(),
            "ledger.clear"
        );
        Ok(res.rows_affected())
    }
}

async fn insert_if_absent(
    pool: &SqlitePool,
    path: &str,
    last_modified: i64,
    uploaded_at: i64,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        INSERT OR IGNORE INTO uploads (path, last_modified, uploaded_at)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(path)
    .bind(last_modified)
    .bind(uploaded_at)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub fn export_json(records: &[UploadRecord]) -> Result<String> {
    let entries = records
        .iter()
        .map(|r| InterchangeEntry {
            p: r.path.clone(),
            m: r.last_modified,
            u: Some(r.uploaded_at),
        })
        .collect::<Vec<_>>();
    Ok(serde_json::to_string(&entries)?)
}

/// Parses an interchange export. Entries without `u` are stamped with the current time.
pub fn parse_export_json(text: &str) -> Result<Vec<UploadRecord>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<InterchangeEntry> = serde_json::from_str(trimmed)?;
    let now = now_unix_ms();
    Ok(entries
        .into_iter()
        .map(|e| UploadRecord {
            path: e.p,
            last_modified: e.m,
            uploaded_at: e.u.unwrap_or(now),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_db::open_memory_state_db;

    async fn ledger() -> Ledger {
        Ledger::new(open_memory_state_db().await.unwrap())
    }

    fn record(path: &str, m: i64, u: i64) -> UploadRecord {
        UploadRecord {
            path: path.to_string(),
            last_modified: m,
            uploaded_at: u,
        }
    }

    #[tokio::test]
    async fn marking_twice_keeps_one_record() {
        let ledger = ledger().await;
        ledger.mark_uploaded("/dcim/a.jpg", 100).await.unwrap();
        ledger.mark_uploaded("/dcim/a.jpg", 100).await.unwrap();

        assert!(ledger.is_uploaded("/dcim/a.jpg", 100).await.unwrap());
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn new_mtime_is_a_distinct_record() {
        let ledger = ledger().await;
        ledger.mark_uploaded("/dcim/a.jpg", 100).await.unwrap();

        assert!(!ledger.is_uploaded("/dcim/a.jpg", 101).await.unwrap());

        ledger.mark_uploaded("/dcim/a.jpg", 101).await.unwrap();
        assert_eq!(ledger.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn import_only_adds_missing_records_and_never_overwrites() {
        let ledger = ledger().await;
        ledger
            .import_all(&[record("/a.jpg", 1, 10), record("/b.jpg", 2, 20)])
            .await
            .unwrap();

        let offered = vec![
            record("/a.jpg", 1, 999),
            record("/b.jpg", 2, 999),
            record("/c.jpg", 3, 30),
        ];
        assert_eq!(ledger.import_all(&offered).await.unwrap(), 1);
        assert_eq!(ledger.import_all(&offered).await.unwrap(), 0);
        assert_eq!(ledger.count().await.unwrap(), 3);

        let exported = ledger.export_all().await.unwrap();
        let a = exported.iter().find(|r| r.path == "/a.jpg").unwrap();
        assert_eq!(a.uploaded_at, 10);
    }

    #[tokio::test]
    async fn export_is_newest_first() {
        let ledger = ledger().await;
        ledger
            .import_all(&[
                record("/old.jpg", 1, 10),
                record("/new.jpg", 2, 30),
                record("/mid.jpg", 3, 20),
            ])
            .await
            .unwrap();

        let paths = ledger
            .export_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["/new.jpg", "/mid.jpg", "/old.jpg"]);

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.first_upload_at, Some(10));
        assert_eq!(stats.last_upload_at, Some(30));
    }

    #[test]
    fn interchange_uses_short_keys_and_tolerates_missing_upload_time() {
        let json = export_json(&[record("/a.jpg", 5, 7)]).unwrap();
        assert_eq!(json, r#"[{"p":"/a.jpg","m":5,"u":7}]"#);

        let parsed = parse_export_json(r#"[{"p":"/b.jpg","m":9}]"#).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].path, "/b.jpg");
        assert_eq!(parsed[0].last_modified, 9);
        assert!(parsed[0].uploaded_at > 0);

        assert!(parse_export_json("  ").unwrap().is_empty());
        assert!(parse_export_json("[]").unwrap().is_empty());
    }
}
