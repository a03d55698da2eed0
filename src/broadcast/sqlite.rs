//! SQLite 事件日志：追加写入，订阅者按 offset 轮询
//!
//! `event_id` 唯一，重复投递同一事件不会产生新记录。
//! 配置了保留时长时，打开日志以及每追加 `PRUNE_EVERY` 条记录后删除过期记录；
//! offset 不会复用，游标落在已删除区间的订阅者从下一条存活记录继续。

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Notify;

use super::{EventStream, EventTransport};
use crate::core::TransportError;
use crate::session::{Event, EventFilter};

const PAGE_SIZE: i64 = 256;
const PRUNE_EVERY: u64 = 512;

pub struct SqliteEventTransport {
    pool: SqlitePool,
    appended: Arc<Notify>,
    poll_interval: Duration,
    retention: Option<Duration>,
    inserts: AtomicU64,
}

impl SqliteEventTransport {
    pub async fn open(
        db_path: impl AsRef<Path>,
        poll_interval: Duration,
        retention: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event_log (
                log_offset INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                appended_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_session ON event_log(session_id, log_offset)")
            .execute(&pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_appended ON event_log(appended_at)")
            .execute(&pool)
            .await?;

        let transport = Self {
            pool,
            appended: Arc::new(Notify::new()),
            poll_interval,
            retention,
            inserts: AtomicU64::new(0),
        };
        let pruned = transport.prune().await?;
        if pruned > 0 {
            tracing::info!(pruned, "Pruned expired event log records");
        }
        Ok(transport)
    }

    /// 删除早于保留时长的记录，返回删除条数
    pub async fn prune(&self) -> Result<u64, TransportError> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let cutoff = chrono::Utc::now().timestamp_millis() - retention.as_millis() as i64;
        let result = sqlx::query("DELETE FROM event_log WHERE appended_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// 当前日志末尾 offset（空日志为 0）
    pub async fn head(&self) -> Result<u64, TransportError> {
        let row = sqlx::query("SELECT COALESCE(MAX(log_offset), 0) AS head FROM event_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("head") as u64)
    }
}

async fn fetch_page(
    pool: &SqlitePool,
    filter: &EventFilter,
    after: u64,
) -> Result<Vec<(u64, Event)>, TransportError> {
    let rows = match filter.session_id() {
        Some(session_id) => {
            sqlx::query(
                "SELECT log_offset, body FROM event_log WHERE log_offset > ? AND session_id = ?
                 ORDER BY log_offset LIMIT ?",
            )
            .bind(after as i64)
            .bind(session_id)
            .bind(PAGE_SIZE)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT log_offset, body FROM event_log WHERE log_offset > ? ORDER BY log_offset LIMIT ?")
                .bind(after as i64)
                .bind(PAGE_SIZE)
                .fetch_all(pool)
                .await?
        }
    };

    rows.iter()
        .map(|row| {
            let offset = row.get::<i64, _>("log_offset") as u64;
            let body: String = row.get("body");
            Ok((offset, serde_json::from_str(&body)?))
        })
        .collect()
}

struct Cursor {
    pool: SqlitePool,
    filter: EventFilter,
    after: u64,
    buffered: VecDeque<(u64, Event)>,
    appended: Arc<Notify>,
    poll_interval: Duration,
}

#[async_trait]
impl EventTransport for SqliteEventTransport {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn publish(&self, event: &Event) -> Result<Option<u64>, TransportError> {
        let body = serde_json::to_string(event)?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO event_log (event_id, session_id, kind, body, appended_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.session_id)
        .bind(event.kind.as_str())
        .bind(&body)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        self.appended.notify_waiters();
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let offset = result.last_insert_rowid() as u64;

        if self.inserts.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            // 清理失败不影响本次写入
            match self.prune().await {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!(pruned, "Pruned expired event log records"),
                Err(e) => tracing::warn!("Event log prune failed: {}", e),
            }
        }
        Ok(Some(offset))
    }

    async fn subscribe(&self, filter: EventFilter, after: Option<u64>) -> Result<EventStream, TransportError> {
        let after = match after {
            Some(cursor) => cursor,
            None => self.head().await?,
        };
        let cursor = Cursor {
            pool: self.pool.clone(),
            filter,
            after,
            buffered: VecDeque::new(),
            appended: Arc::clone(&self.appended),
            poll_interval: self.poll_interval,
        };

        let events = stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some((offset, event)) = cursor.buffered.pop_front() {
                    cursor.after = offset;
                    return Some(((Some(offset), event), cursor));
                }
                if cursor.pool.is_closed() {
                    return None;
                }
                let appended = Arc::clone(&cursor.appended);
                let notified = appended.notified();
                match fetch_page(&cursor.pool, &cursor.filter, cursor.after).await {
                    Ok(page) if !page.is_empty() => {
                        cursor.buffered.extend(page);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Event log poll failed: {}", e),
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(cursor.poll_interval) => {}
                }
            }
        });
        Ok(Box::pin(events))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EventKind;
    use futures_util::StreamExt;
    use serde_json::Value;

    #[tokio::test]
    async fn test_replay_from_cursor_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SqliteEventTransport::open(dir.path().join("events.db"), Duration::from_millis(10), None)
            .await
            .unwrap();

        let first = Event::new("session_a", 1, EventKind::SessionStarted, Value::Null);
        let second = Event::new("session_a", 2, EventKind::ActionQueued, Value::Null);
        let other = Event::new("session_b", 1, EventKind::SessionStarted, Value::Null);

        assert_eq!(transport.publish(&first).await.unwrap(), Some(1));
        assert_eq!(transport.publish(&first).await.unwrap(), None);
        transport.publish(&other).await.unwrap();
        transport.publish(&second).await.unwrap();

        let mut replay = transport
            .subscribe(EventFilter::Session("session_a".into()), Some(0))
            .await
            .unwrap();
        let (c1, e1) = replay.next().await.unwrap();
        let (c2, e2) = replay.next().await.unwrap();
        assert_eq!((c1, e1.id.as_str()), (Some(1), "session_a:1"));
        assert_eq!(e2.id, "session_a:2");
        assert!(c2 > c1);

        let mut from_one = transport.subscribe(EventFilter::All, Some(1)).await.unwrap();
        assert_eq!(from_one.next().await.unwrap().1.session_id, "session_b");
    }

    #[tokio::test]
    async fn test_live_subscription_starts_at_head() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SqliteEventTransport::open(dir.path().join("events.db"), Duration::from_millis(10), None)
            .await
            .unwrap();
        transport
            .publish(&Event::new("session_a", 1, EventKind::SessionStarted, Value::Null))
            .await
            .unwrap();

        let mut live = transport.subscribe(EventFilter::All, None).await.unwrap();
        transport
            .publish(&Event::new("session_a", 2, EventKind::SessionEnded, Value::Null))
            .await
            .unwrap();

        let (_, event) = tokio::time::timeout(Duration::from_secs(1), live.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.seq, 2);
    }

    #[tokio::test]
    async fn test_retention_prunes_old_records() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SqliteEventTransport::open(
            dir.path().join("events.db"),
            Duration::from_millis(10),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        for seq in 1..=2 {
            transport
                .publish(&Event::new("session_a", seq, EventKind::ActionQueued, Value::Null))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let kept = Event::new("session_a", 3, EventKind::SessionEnded, Value::Null);
        assert_eq!(transport.publish(&kept).await.unwrap(), Some(3));

        assert_eq!(transport.prune().await.unwrap(), 2);
        let mut replay = transport.subscribe(EventFilter::All, Some(0)).await.unwrap();
        let (offset, event) = replay.next().await.unwrap();
        assert_eq!((offset, event.seq), (Some(3), 3));
        assert_eq!(transport.head().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reopen_prunes_expired_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let transport = SqliteEventTransport::open(&path, Duration::from_millis(10), None)
                .await
                .unwrap();
            transport
                .publish(&Event::new("session_a", 1, EventKind::SessionStarted, Value::Null))
                .await
                .unwrap();
            transport.close().await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let reopened = SqliteEventTransport::open(&path, Duration::from_millis(10), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(fetch_page(&reopened.pool, &EventFilter::All, 0).await.unwrap().is_empty());
    }
}
