//! 事件广播：按会话发布状态迁移事件
//!
//! - 进程内传输：`publish` 返回前已投递到所有已连接订阅者（晚到订阅者会错过）
//! - 持久化传输：事件进入有界的有序发件箱，由后台任务带退避重试写入日志；
//!   `publish` 等到该事件写入成功或重试耗尽后才返回，失败达上限的事件记录并丢弃
//!
//! 发布失败从不回滚触发它的状态迁移。

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use memory::InProcessTransport;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteEventTransport;

use crate::config::{BackendKind, EventsSection};
use crate::core::TransportError;
use crate::queue::retry_transport;
use crate::session::{Event, EventFilter};

/// 传输层输出：(日志 offset，事件)；进程内传输没有 offset
pub type EventStream = Pin<Box<dyn Stream<Item = (Option<u64>, Event)> + Send>>;

/// 发布/订阅后端
#[async_trait]
pub trait EventTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// 是否保留历史（支持从游标重放）
    fn is_durable(&self) -> bool;

    /// 写入一条事件，返回其日志 offset（重复写入返回 None）
    async fn publish(&self, event: &Event) -> Result<Option<u64>, TransportError>;

    /// after 为 None 时只接收之后发布的事件
    async fn subscribe(&self, filter: EventFilter, after: Option<u64>) -> Result<EventStream, TransportError>;

    async fn close(&self);
}

/// 订阅句柄：无限事件流，直到被 drop 或广播器关闭
pub struct EventSubscription {
    inner: EventStream,
    cursor: Option<u64>,
}

impl EventSubscription {
    /// 最近收到事件的日志 offset，可用于断线后 `subscribe_from`
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.next().await
    }
}

impl Stream for EventSubscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some((offset, event))) => {
                if offset.is_some() {
                    self.cursor = offset;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// 投递统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BroadcastStats {
    pub published: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// 发件箱条目：写入完成（或放弃）后通过 ack 通知发布方
type OutboxItem = (Event, oneshot::Sender<()>);

pub struct EventBroadcaster {
    transport: Arc<dyn EventTransport>,
    outbox: Mutex<Option<mpsc::Sender<OutboxItem>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl EventBroadcaster {
    /// 包装传输层；持久化传输会启动发件箱任务（需在 tokio 运行时内调用）
    ///
    /// 发件箱满时 `publish` 等待空位。
    pub fn new(
        transport: Arc<dyn EventTransport>,
        outbox_capacity: usize,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let (outbox, pump) = if transport.is_durable() {
            let (tx, rx) = mpsc::channel(outbox_capacity.max(1));
            let pump = tokio::spawn(run_outbox(
                rx,
                Arc::clone(&transport),
                Arc::clone(&counters),
                max_attempts,
                base_delay,
            ));
            (Some(tx), Some(pump))
        } else {
            (None, None)
        };

        Self {
            transport,
            outbox: Mutex::new(outbox),
            pump: Mutex::new(pump),
            counters,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn in_process(capacity: usize) -> Self {
        Self::new(Arc::new(InProcessTransport::new(capacity)), 1, 1, Duration::ZERO)
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn is_durable(&self) -> bool {
        self.transport.is_durable()
    }

    /// 发布事件；从不返回错误
    ///
    /// 持久化传输下返回时事件已写入日志（或已因重试耗尽被丢弃）。
    pub async fn publish(&self, event: Event) {
        if self.shutdown.is_cancelled() {
            tracing::debug!(event_id = %event.id, "Broadcaster closed, event not published");
            return;
        }

        let outbox = self.outbox.lock().await.clone();
        if let Some(tx) = outbox {
            let (ack_tx, ack_rx) = oneshot::channel();
            if let Err(mpsc::error::SendError((event, _))) = tx.send((event, ack_tx)).await {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event_id = %event.id, "Event outbox closed, event dropped");
                return;
            }
            // 发件箱任务退出时 ack 会被 drop，同样视为结束
            let _ = ack_rx.await;
            return;
        }

        match self.transport.publish(&event).await {
            Ok(_) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_id = %event.id,
                    session_id = %event.session_id,
                    "Event publish failed: {}",
                    e
                );
            }
        }
    }

    /// 订阅之后发布的事件
    pub async fn subscribe(&self, filter: EventFilter) -> Result<EventSubscription, TransportError> {
        self.open(filter, None).await
    }

    /// 从日志 offset 之后开始重放（仅持久化传输）
    pub async fn subscribe_from(&self, filter: EventFilter, cursor: u64) -> Result<EventSubscription, TransportError> {
        self.open(filter, Some(cursor)).await
    }

    async fn open(&self, filter: EventFilter, after: Option<u64>) -> Result<EventSubscription, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let stream = self.transport.subscribe(filter, after).await?;
        let stream = stream.take_until(self.shutdown.clone().cancelled_owned());
        Ok(EventSubscription {
            inner: Box::pin(stream),
            cursor: after,
        })
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// 结束所有订阅；发件箱中已排队的事件会先写完
    pub async fn shutdown(&self) {
        self.outbox.lock().await.take();
        if let Some(pump) = self.pump.lock().await.take() {
            if let Err(e) = pump.await {
                tracing::warn!("Event outbox task failed: {}", e);
            }
        }
        self.shutdown.cancel();
        self.transport.close().await;
    }
}

/// 按顺序写入持久化传输；单条事件失败时退避重试，不会越过它发送后面的事件
async fn run_outbox(
    mut rx: mpsc::Receiver<OutboxItem>,
    transport: Arc<dyn EventTransport>,
    counters: Arc<Counters>,
    max_attempts: u32,
    base_delay: Duration,
) {
    while let Some((event, ack)) = rx.recv().await {
        let result = retry_transport("event publish", max_attempts, base_delay, || transport.publish(&event)).await;
        match result {
            Ok(_) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    event_id = %event.id,
                    session_id = %event.session_id,
                    attempts = max_attempts,
                    "Event dropped after retries: {}",
                    e
                );
            }
        }
        let _ = ack.send(());
    }
    tracing::debug!("Event outbox drained");
}

/// 按配置创建广播器；持久化日志不可用时退回进程内传输
pub async fn create_event_broadcaster(cfg: &EventsSection) -> EventBroadcaster {
    let transport: Arc<dyn EventTransport> = match cfg.backend {
        BackendKind::Memory => Arc::new(InProcessTransport::new(cfg.channel_capacity)),
        BackendKind::Sqlite => open_sqlite(cfg).await,
    };
    tracing::info!(transport = transport.name(), "Event broadcaster ready");
    EventBroadcaster::new(
        transport,
        cfg.outbox_capacity,
        cfg.publish_max_attempts,
        cfg.publish_base_delay(),
    )
}

#[cfg(feature = "async-sqlite")]
async fn open_sqlite(cfg: &EventsSection) -> Arc<dyn EventTransport> {
    let path = cfg
        .path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("stagehand_events.db"));
    match SqliteEventTransport::open(&path, cfg.poll_interval(), cfg.log_retention()).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            tracing::warn!(
                "Event log at {} unavailable ({}), falling back to in-process transport",
                path.display(),
                e
            );
            Arc::new(InProcessTransport::new(cfg.channel_capacity))
        }
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn open_sqlite(cfg: &EventsSection) -> Arc<dyn EventTransport> {
    tracing::warn!("SQLite event log requested but the async-sqlite feature is disabled, using in-process transport");
    Arc::new(InProcessTransport::new(cfg.channel_capacity))
}
