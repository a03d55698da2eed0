//! 重试延迟队列
//!
//! 重试的退避等待不占用会话 worker：失败动作被登记到延迟队列，
//! 到期后由分发任务重新放回所属会话的 FIFO 队尾。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;

/// 一条待重试记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedRetry {
    pub session_id: String,
    pub action_id: String,
    pub due_at: DateTime<Utc>,
}

impl DelayedRetry {
    /// 距到期还剩多久（已到期为 0）
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.due_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// 延迟队列后端
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// 是否跨重启保留
    fn is_durable(&self) -> bool;

    async fn schedule(&self, retry: DelayedRetry) -> Result<(), TransportError>;

    /// 等待下一条到期记录；队列关闭后返回 None
    async fn next_due(&self) -> Option<DelayedRetry>;

    /// 确认已处理（持久化后端据此删除记录）
    async fn ack(&self, retry: &DelayedRetry) -> Result<(), TransportError>;

    async fn close(&self);
}

/// 进程内定时表（按到期时间排序）
pub struct InMemoryDelayQueue {
    entries: Mutex<BTreeMap<(DateTime<Utc>, u64), DelayedRetry>>,
    seq: std::sync::atomic::AtomicU64,
    wake: Notify,
    closed: CancellationToken,
}

impl InMemoryDelayQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            seq: std::sync::atomic::AtomicU64::new(0),
            wake: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// 取出已到期的首条记录，否则返回距首条到期的时长
    async fn poll(&self) -> Result<DelayedRetry, Option<Duration>> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let Some((&key, first)) = entries.iter().next() else {
            return Err(None);
        };
        if first.due_at > now {
            return Err(Some(first.remaining(now)));
        }
        entries.remove(&key).ok_or(None)
    }
}

impl Default for InMemoryDelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DelayQueue for InMemoryDelayQueue {
    fn is_durable(&self) -> bool {
        false
    }

    async fn schedule(&self, retry: DelayedRetry) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.entries.lock().await.insert((retry.due_at, seq), retry);
        self.wake.notify_one();
        Ok(())
    }

    async fn next_due(&self) -> Option<DelayedRetry> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            let wait = match self.poll().await {
                Ok(retry) => return Some(retry),
                Err(wait) => wait.unwrap_or(Duration::from_secs(3600)),
            };
            tokio::select! {
                _ = self.closed.cancelled() => return None,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, _retry: &DelayedRetry) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn retry(action_id: &str, in_ms: i64) -> DelayedRetry {
        DelayedRetry {
            session_id: "session_a".into(),
            action_id: action_id.into(),
            due_at: Utc::now() + chrono::Duration::milliseconds(in_ms),
        }
    }

    #[tokio::test]
    async fn test_delivers_in_due_order() {
        let queue = InMemoryDelayQueue::new();
        queue.schedule(retry("late", 60)).await.unwrap();
        queue.schedule(retry("early", 10)).await.unwrap();

        let first = queue.next_due().await.unwrap();
        let second = queue.next_due().await.unwrap();
        assert_eq!(first.action_id, "early");
        assert_eq!(second.action_id, "late");
        assert!(second.due_at <= Utc::now());
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_wakes_on_earlier_schedule() {
        let queue = Arc::new(InMemoryDelayQueue::new());
        queue.schedule(retry("slow", 5_000)).await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_due().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.schedule(retry("fast", 10)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.action_id, "fast");
    }

    #[tokio::test]
    async fn test_close_releases_waiter() {
        let queue = Arc::new(InMemoryDelayQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_due().await })
        };
        queue.close().await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(got.is_none());
        assert!(queue.schedule(retry("x", 0)).await.is_err());
    }
}
