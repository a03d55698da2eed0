//! 动作队列：FIFO 顺序、滚动窗口限流、重试退避与延迟队列

mod action_queue;
mod delay;
mod rate_limit;
mod retry;
#[cfg(feature = "async-sqlite")]
mod sqlite_delay;

use std::sync::Arc;

pub use action_queue::{ActionQueue, Completion, Next, Restored, StartedAction};
pub use delay::{DelayQueue, DelayedRetry, InMemoryDelayQueue};
pub use rate_limit::RollingWindow;
pub use retry::{retry_transport, AbandonReason, RetryDecision, RetryPolicy};
#[cfg(feature = "async-sqlite")]
pub use sqlite_delay::SqliteDelayQueue;

use crate::config::{BackendKind, QueueSection};

/// 按配置创建延迟队列；SQLite 不可用时退回进程内实现
pub async fn create_delay_queue(cfg: &QueueSection) -> Arc<dyn DelayQueue> {
    match cfg.backend {
        BackendKind::Memory => Arc::new(InMemoryDelayQueue::new()),
        BackendKind::Sqlite => open_sqlite(cfg).await,
    }
}

#[cfg(feature = "async-sqlite")]
async fn open_sqlite(cfg: &QueueSection) -> Arc<dyn DelayQueue> {
    let path = cfg
        .path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("stagehand_retries.db"));
    match SqliteDelayQueue::open(&path, cfg.poll_interval()).await {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            tracing::warn!(
                "Retry queue at {} unavailable ({}), falling back to in-memory timers",
                path.display(),
                e
            );
            Arc::new(InMemoryDelayQueue::new())
        }
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn open_sqlite(_cfg: &QueueSection) -> Arc<dyn DelayQueue> {
    tracing::warn!("SQLite retry queue requested but the async-sqlite feature is disabled, using in-memory timers");
    Arc::new(InMemoryDelayQueue::new())
}
