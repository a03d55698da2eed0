//! SQLite 延迟队列（至少一次投递）
//!
//! 取出的记录先标记 claimed，ack 后才删除；打开数据库时清除 claimed 标记，
//! 进程崩溃前未 ack 的重试会在重启后再次投递。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio_util::sync::CancellationToken;

use super::delay::{DelayQueue, DelayedRetry};
use crate::core::TransportError;

pub struct SqliteDelayQueue {
    pool: SqlitePool,
    poll_interval: Duration,
    closed: CancellationToken,
}

impl SqliteDelayQueue {
    pub async fn open(db_path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, TransportError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS retry_queue (
                session_id TEXT NOT NULL,
                action_id TEXT NOT NULL,
                due_at INTEGER NOT NULL,
                claimed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (session_id, action_id)
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_retry_due ON retry_queue(claimed, due_at)")
            .execute(&pool)
            .await?;

        let reset = sqlx::query("UPDATE retry_queue SET claimed = 0 WHERE claimed = 1")
            .execute(&pool)
            .await?
            .rows_affected();
        if reset > 0 {
            tracing::info!("Released {} unacknowledged retries", reset);
        }

        Ok(Self {
            pool,
            poll_interval,
            closed: CancellationToken::new(),
        })
    }

    /// 认领一条到期记录
    async fn claim(&self) -> Result<Option<DelayedRetry>, TransportError> {
        let now = Utc::now().timestamp_millis();
        let row = sqlx::query(
            "SELECT session_id, action_id, due_at FROM retry_queue
             WHERE claimed = 0 AND due_at <= ?
             ORDER BY due_at ASC LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let session_id: String = row.get("session_id");
        let action_id: String = row.get("action_id");
        let due_ms: i64 = row.get("due_at");

        let claimed = sqlx::query(
            "UPDATE retry_queue SET claimed = 1 WHERE session_id = ? AND action_id = ? AND claimed = 0",
        )
        .bind(&session_id)
        .bind(&action_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if claimed == 0 {
            return Ok(None);
        }

        Ok(Some(DelayedRetry {
            session_id,
            action_id,
            due_at: Utc.timestamp_millis_opt(due_ms).single().unwrap_or_else(Utc::now),
        }))
    }

    pub async fn pending(&self) -> Result<i64, TransportError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM retry_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl DelayQueue for SqliteDelayQueue {
    fn is_durable(&self) -> bool {
        true
    }

    async fn schedule(&self, retry: DelayedRetry) -> Result<(), TransportError> {
        sqlx::query(
            "INSERT OR REPLACE INTO retry_queue (session_id, action_id, due_at, claimed)
             VALUES (?, ?, ?, 0)",
        )
        .bind(&retry.session_id)
        .bind(&retry.action_id)
        .bind(retry.due_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_due(&self) -> Option<DelayedRetry> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            match self.claim().await {
                Ok(Some(retry)) => return Some(retry),
                Ok(None) => {}
                Err(e) => tracing::warn!("Retry queue poll failed: {}", e),
            }
            tokio::select! {
                _ = self.closed.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, retry: &DelayedRetry) -> Result<(), TransportError> {
        sqlx::query("DELETE FROM retry_queue WHERE session_id = ? AND action_id = ? AND claimed = 1")
            .bind(&retry.session_id)
            .bind(&retry.action_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(action_id: &str) -> DelayedRetry {
        DelayedRetry {
            session_id: "session_a".into(),
            action_id: action_id.into(),
            due_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unacked_retry_is_redelivered_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retries.db");

        let queue = SqliteDelayQueue::open(&path, Duration::from_millis(10)).await.unwrap();
        queue.schedule(retry("action_1")).await.unwrap();
        let first = queue.next_due().await.unwrap();
        assert_eq!(first.action_id, "action_1");
        queue.close().await;

        let reopened = SqliteDelayQueue::open(&path, Duration::from_millis(10)).await.unwrap();
        let again = reopened.next_due().await.unwrap();
        assert_eq!(again.action_id, "action_1");
        reopened.ack(&again).await.unwrap();
        assert_eq!(reopened.pending().await.unwrap(), 0);
    }
}
