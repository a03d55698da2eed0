//! SQLite 键值后端（`expires_at` 毫秒时间戳列，读时过滤）

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::kv::KvBackend;
use crate::core::TransportError;

pub struct SqliteKv {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqliteKv {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv_store(expires_at)")
            .execute(&pool)
            .await?;

        let kv = Self { pool };
        let purged = kv.purge_expired().await?;
        if purged > 0 {
            tracing::info!("Purged {} expired records from {}", purged, db_path.as_ref().display());
        }
        Ok(kv)
    }

    pub async fn purge_expired(&self) -> Result<u64, TransportError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KvBackend for SqliteKv {
    fn is_durable(&self) -> bool {
        true
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), TransportError> {
        let expires_at = ttl.map(|ttl| now_ms() + ttl.as_millis() as i64);
        sqlx::query("INSERT OR REPLACE INTO kv_store (key, value, expires_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(&value)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        let row = sqlx::query(
            "SELECT value FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn delete(&self, key: &str) -> Result<(), TransportError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TransportError> {
        let rows = sqlx::query(
            "SELECT key FROM kv_store
             WHERE substr(key, 1, length(?1)) = ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key",
        )
        .bind(prefix)
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("key")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let kv = SqliteKv::open(&path).await.unwrap();
        kv.set("session:a", "{\"id\":\"a\"}".into(), None).await.unwrap();
        kv.set("session:b", "{}".into(), Some(Duration::from_millis(10))).await.unwrap();
        drop(kv);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let kv = SqliteKv::open(&path).await.unwrap();
        assert_eq!(kv.get("session:a").await.unwrap().as_deref(), Some("{\"id\":\"a\"}"));
        assert!(kv.get("session:b").await.unwrap().is_none());
        assert_eq!(kv.keys("session:").await.unwrap(), vec!["session:a".to_string()]);
    }
}
