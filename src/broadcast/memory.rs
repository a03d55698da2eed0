//! 进程内事件传输：每个订阅者一条无界通道
//!
//! 只投递给订阅时已连接的接收端，不保留历史；晚到的订阅者会错过之前的事件。
//! 已连接的订阅者不会丢事件，消费慢时积压在自己的通道里，积压超过 `capacity` 时告警。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{mpsc, Mutex};

use super::{EventStream, EventTransport};
use crate::core::TransportError;
use crate::session::{Event, EventFilter};

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
    backlog: Arc<AtomicUsize>,
}

pub struct InProcessTransport {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
}

impl InProcessTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl EventTransport for InProcessTransport {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn publish(&self, event: &Event) -> Result<Option<u64>, TransportError> {
        let mut subscribers = self.subscribers.lock().await;
        // 接收端已 drop 的订阅在这里顺带清掉
        subscribers.retain(|sub| {
            if !sub.filter.matches(event) {
                return !sub.tx.is_closed();
            }
            if sub.tx.send(event.clone()).is_err() {
                return false;
            }
            let backlog = sub.backlog.fetch_add(1, Ordering::Relaxed) + 1;
            if backlog == self.capacity {
                tracing::warn!(backlog, "Event subscriber is falling behind");
            }
            true
        });
        Ok(None)
    }

    async fn subscribe(&self, filter: EventFilter, after: Option<u64>) -> Result<EventStream, TransportError> {
        if after.is_some() {
            return Err(TransportError::ReplayUnsupported(self.name()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        self.subscribers.lock().await.push(Subscriber {
            filter,
            tx,
            backlog: Arc::clone(&backlog),
        });

        let events = stream::unfold((rx, backlog), |(mut rx, backlog)| async move {
            let event = rx.recv().await?;
            backlog.fetch_sub(1, Ordering::Relaxed);
            Some(((None, event), (rx, backlog)))
        });
        Ok(Box::pin(events))
    }

    /// 断开全部订阅者，它们的流随之结束
    async fn close(&self) {
        self.subscribers.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EventKind;
    use futures_util::StreamExt;
    use serde_json::Value;

    #[tokio::test]
    async fn test_filtered_delivery() {
        let transport = InProcessTransport::new(16);
        let mut only_a = transport
            .subscribe(EventFilter::Session("session_a".into()), None)
            .await
            .unwrap();

        transport
            .publish(&Event::new("session_b", 1, EventKind::SessionStarted, Value::Null))
            .await
            .unwrap();
        transport
            .publish(&Event::new("session_a", 1, EventKind::SessionStarted, Value::Null))
            .await
            .unwrap();

        let (cursor, event) = only_a.next().await.unwrap();
        assert_eq!(cursor, None);
        assert_eq!(event.session_id, "session_a");
    }

    #[tokio::test]
    async fn test_slow_subscriber_keeps_every_event() {
        let transport = InProcessTransport::new(4);
        let mut slow = transport.subscribe(EventFilter::All, None).await.unwrap();

        for seq in 1..=10 {
            transport
                .publish(&Event::new("session_a", seq, EventKind::ActionQueued, Value::Null))
                .await
                .unwrap();
        }

        for seq in 1..=10 {
            let (_, event) = slow.next().await.unwrap();
            assert_eq!(event.seq, seq);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let transport = InProcessTransport::new(4);
        let gone = transport.subscribe(EventFilter::All, None).await.unwrap();
        let mut kept = transport.subscribe(EventFilter::All, None).await.unwrap();
        drop(gone);

        transport
            .publish(&Event::new("session_a", 1, EventKind::SessionStarted, Value::Null))
            .await
            .unwrap();
        assert_eq!(transport.subscribers.lock().await.len(), 1);
        assert_eq!(kept.next().await.unwrap().1.seq, 1);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let transport = InProcessTransport::new(4);
        let mut sub = transport.subscribe(EventFilter::All, None).await.unwrap();
        transport.close().await;
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_replay_is_rejected() {
        let transport = InProcessTransport::new(16);
        let result = transport.subscribe(EventFilter::All, Some(0)).await;
        assert!(matches!(result, Err(TransportError::ReplayUnsupported(_))));
    }
}
