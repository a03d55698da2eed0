//! FlowManager：会话生命周期的唯一入口
//!
//! 组合动作队列、延迟队列、事件广播与会话存储。所有状态迁移都在会话状态锁内完成，
//! 先发布事件再保存快照。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::handle::{SessionHandle, SessionState};
use super::{watchdog, worker};
use crate::broadcast::{create_event_broadcaster, BroadcastStats, EventBroadcaster, EventSubscription};
use crate::collaborator::AutomationCollaborator;
use crate::config::{AppConfig, EndPolicy, QueueSection, SessionSection};
use crate::core::{OrchestratorError, Result};
use crate::queue::{create_delay_queue, retry_transport, ActionQueue, DelayQueue, RetryPolicy, RollingWindow};
use crate::session::{ActionId, ActionKind, Event, EventFilter, EventKind, Session, SessionStatus};
use crate::store::{create_session_store, SessionStore};

/// start_session 的可选参数
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// 无活动超时；None 时使用配置的默认值
    pub timeout: Option<Duration>,
    /// 调用方标识（按调用方限制会话数）
    pub caller: Option<String>,
    /// 交给协作方的不透明上下文
    pub context: Value,
}

pub(crate) struct FlowSettings {
    pub session: SessionSection,
    pub queue: QueueSection,
    pub retry: Arc<RetryPolicy>,
    pub save_max_attempts: u32,
    pub save_base_delay: Duration,
}

pub(crate) struct FlowInner {
    pub settings: FlowSettings,
    pub sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    pub store: SessionStore,
    pub broadcaster: Arc<EventBroadcaster>,
    pub collaborator: Arc<dyn AutomationCollaborator>,
    pub delay_queue: Arc<dyn DelayQueue>,
    pub shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FlowInner {
    pub fn new_queue(&self) -> ActionQueue {
        ActionQueue::new(Arc::clone(&self.settings.retry), self.limiter())
    }

    pub fn limiter(&self) -> RollingWindow {
        RollingWindow::new(
            self.settings.queue.rate_limit_max,
            self.settings.queue.rate_limit_window(),
        )
    }

    /// 按顺序发布事件，持久化日志确认写入后再保存快照；调用方持有会话状态锁
    pub async fn commit(&self, session: &Session, events: Vec<Event>) {
        for event in events {
            self.broadcaster.publish(event).await;
        }
        self.persist(session).await;
    }

    /// 保存失败时退避重试，最终失败只记录日志，内存状态保持权威
    pub async fn persist(&self, session: &Session) {
        let saved = retry_transport(
            "session save",
            self.settings.save_max_attempts,
            self.settings.save_base_delay,
            || self.store.save(session),
        )
        .await;
        if let Err(e) = saved {
            tracing::error!(session_id = %session.id, "Session snapshot not saved: {}", e);
        }
    }

    /// 进入终态：取消未开始的动作，发布终态事件并保存；调用方持有执行锁与状态锁
    pub async fn terminate(
        &self,
        handle: &SessionHandle,
        st: &mut SessionState,
        status: SessionStatus,
        kind: EventKind,
        reason: &str,
        extra: Value,
    ) {
        let mut events = st.queue.cancel_outstanding(&mut st.session, reason);
        let cancelled = events.len();
        st.session.status = status;
        st.session.ended_at = Some(Utc::now());
        let mut payload = json!({
            "reason": reason,
            "cancelled": cancelled,
            "actions": st.session.actions.len(),
        });
        if let (Some(base), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            base.extend(extra);
        }
        events.push(st.session.next_event(kind, payload));
        self.commit(&st.session, events).await;
        handle.mark_finished();
        tracing::info!(
            session_id = %st.session.id,
            status = %status,
            cancelled,
            "Session terminated"
        );
    }

    pub async fn spawn_worker(self: &Arc<Self>, handle: Arc<SessionHandle>) {
        let worker = tokio::spawn(worker::run(Arc::clone(self), Arc::clone(&handle)));
        handle.set_worker(worker).await;
    }

    pub async fn handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// 从存储恢复未终止的会话，重建队列并重启 worker
    async fn recover(self: &Arc<Self>) -> Result<usize> {
        let mut recovered = 0;
        for mut session in self.store.list().await? {
            if session.status.is_terminal() {
                continue;
            }
            let restored = ActionQueue::restore(&mut session, Arc::clone(&self.settings.retry), self.limiter());
            let handle = Arc::new(SessionHandle::new(session, restored.queue, self.shutdown.child_token()));
            {
                let state = handle.state.lock().await;
                self.commit(&state.session, restored.events).await;
            }
            for retry in restored.retries {
                if let Err(e) = self.delay_queue.schedule(retry).await {
                    tracing::warn!(session_id = %handle.id, "Failed to reschedule retry: {}", e);
                }
            }
            self.sessions
                .write()
                .await
                .insert(handle.id.clone(), Arc::clone(&handle));
            self.spawn_worker(Arc::clone(&handle)).await;
            handle.wake.notify_one();
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!("Recovered {} sessions from store", recovered);
        }
        Ok(recovered)
    }
}

/// 会话编排器（可廉价克隆，共享同一内部状态）
#[derive(Clone)]
pub struct FlowManager {
    inner: Arc<FlowInner>,
}

/// FlowManager 构建器：未显式提供的组件按配置创建
pub struct FlowManagerBuilder {
    config: AppConfig,
    collaborator: Arc<dyn AutomationCollaborator>,
    store: Option<SessionStore>,
    broadcaster: Option<EventBroadcaster>,
    delay_queue: Option<Arc<dyn DelayQueue>>,
}

impl FlowManagerBuilder {
    pub fn new(collaborator: Arc<dyn AutomationCollaborator>) -> Self {
        Self {
            config: AppConfig::default(),
            collaborator,
            store: None,
            broadcaster: None,
            delay_queue: None,
        }
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broadcaster(mut self, broadcaster: EventBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn delay_queue(mut self, delay_queue: Arc<dyn DelayQueue>) -> Self {
        self.delay_queue = Some(delay_queue);
        self
    }

    /// 创建管理器、恢复已持久化的会话并启动后台任务
    pub async fn build(self) -> Result<FlowManager> {
        let config = self.config;
        let store = match self.store {
            Some(store) => store,
            None => create_session_store(&config.store).await,
        };
        let broadcaster = match self.broadcaster {
            Some(broadcaster) => broadcaster,
            None => create_event_broadcaster(&config.events).await,
        };
        let delay_queue = match self.delay_queue {
            Some(queue) => queue,
            None => create_delay_queue(&config.queue).await,
        };

        let inner = Arc::new(FlowInner {
            settings: FlowSettings {
                session: config.session.clone(),
                queue: config.queue.clone(),
                retry: Arc::new(config.retry.clone()),
                save_max_attempts: config.store.save_max_attempts,
                save_base_delay: config.store.save_base_delay(),
            },
            sessions: RwLock::new(HashMap::new()),
            store,
            broadcaster: Arc::new(broadcaster),
            collaborator: self.collaborator,
            delay_queue,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        inner.recover().await?;

        let watchdog = tokio::spawn(watchdog::run(Arc::clone(&inner)));
        let dispatcher = tokio::spawn(worker::run_retry_dispatcher(Arc::clone(&inner)));
        inner.tasks.lock().await.extend([watchdog, dispatcher]);

        tracing::info!(
            store_durable = inner.store.is_durable(),
            transport = inner.broadcaster.transport_name(),
            retries_durable = inner.delay_queue.is_durable(),
            "Flow manager started"
        );
        Ok(FlowManager { inner })
    }
}

impl FlowManager {
    pub fn builder(collaborator: Arc<dyn AutomationCollaborator>) -> FlowManagerBuilder {
        FlowManagerBuilder::new(collaborator)
    }

    /// 按配置创建所有后端（不可用时退回进程内实现）
    pub async fn from_config(config: &AppConfig, collaborator: Arc<dyn AutomationCollaborator>) -> Result<Self> {
        Self::builder(collaborator).config(config.clone()).build().await
    }

    fn ensure_running(&self, operation: &str) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::invalid_state("flow_manager", "shutting_down", operation));
        }
        Ok(())
    }

    /// 以给定超时开始会话
    pub async fn start_session(&self, timeout: Duration) -> Result<Session> {
        self.start_session_with(SessionOptions {
            timeout: Some(timeout),
            ..SessionOptions::default()
        })
        .await
    }

    pub async fn start_session_with(&self, options: SessionOptions) -> Result<Session> {
        self.ensure_running("start_session")?;
        let inner = &self.inner;
        let limits = &inner.settings.session;
        let timeout = options.timeout.unwrap_or_else(|| limits.default_timeout());
        let mut session = Session::new(timeout, options.caller, options.context);

        let mut sessions = inner.sessions.write().await;
        if let Some(max) = limits.max_sessions {
            let live = sessions.values().filter(|h| h.is_live()).count();
            if live >= max {
                return Err(OrchestratorError::Capacity(format!("{} live sessions (max {})", live, max)));
            }
        }
        if let (Some(max), Some(caller)) = (limits.max_sessions_per_caller, session.caller.as_deref()) {
            let owned = sessions
                .values()
                .filter(|h| h.is_live() && h.caller.as_deref() == Some(caller))
                .count();
            if owned >= max {
                return Err(OrchestratorError::Capacity(format!(
                    "caller {} has {} live sessions (max {})",
                    caller, owned, max
                )));
            }
        }

        session.status = SessionStatus::Active;
        let started = session.next_event(
            EventKind::SessionStarted,
            json!({
                "from": SessionStatus::Created,
                "timeout_ms": timeout.as_millis() as u64,
                "caller": session.caller,
            }),
        );
        let handle = Arc::new(SessionHandle::new(session, inner.new_queue(), inner.shutdown.child_token()));
        let state = handle.state.lock().await;
        sessions.insert(handle.id.clone(), Arc::clone(&handle));
        drop(sessions);

        inner.commit(&state.session, vec![started]).await;
        let snapshot = state.session.clone();
        drop(state);

        inner.spawn_worker(Arc::clone(&handle)).await;
        tracing::info!(
            session_id = %snapshot.id,
            timeout_ms = timeout.as_millis() as u64,
            "Session started"
        );
        Ok(snapshot)
    }

    /// 不在内存中的会话：存储里有记录则按其状态拒绝，否则 NotFound
    async fn missing(&self, session_id: &str, operation: &str) -> OrchestratorError {
        match self.inner.store.load(session_id).await {
            Ok(session) => OrchestratorError::invalid_state(session_id, session.status, operation),
            Err(e) => e,
        }
    }

    /// 提交动作，立即返回动作 ID（不等待执行）
    pub async fn submit_action(&self, session_id: &str, kind: ActionKind, params: Value) -> Result<ActionId> {
        self.ensure_running("submit_action")?;
        let Some(handle) = self.inner.handle(session_id).await else {
            return Err(self.missing(session_id, "submit_action").await);
        };

        let action_id = {
            let mut state = handle.state.lock().await;
            let st = &mut *state;
            if st.closing {
                return Err(OrchestratorError::invalid_state(session_id, "closing", "submit_action"));
            }
            if !st.session.status.accepts_actions() {
                return Err(OrchestratorError::invalid_state(session_id, st.session.status, "submit_action"));
            }

            let mut events = Vec::with_capacity(2);
            if st.session.status == SessionStatus::Idle {
                st.session.status = SessionStatus::Active;
                let idle_ms = st.session.idle_for(Utc::now()).as_millis() as u64;
                events.push(st.session.next_event(EventKind::SessionResumed, json!({ "idle_ms": idle_ms })));
            }
            st.session.touch();
            let (action_id, queued) = st.queue.enqueue(&mut st.session, kind, params);
            events.push(queued);
            self.inner.commit(&st.session, events).await;
            action_id
        };

        handle.wake.notify_one();
        tracing::debug!(session_id, action_id = %action_id, kind = %kind, "Action submitted");
        Ok(action_id)
    }

    /// 当前会话快照；已从内存移除的会话从存储读取
    pub async fn get_status(&self, session_id: &str) -> Result<Session> {
        match self.inner.handle(session_id).await {
            Some(handle) => Ok(handle.snapshot().await),
            None => self.inner.store.load(session_id).await,
        }
    }

    /// 结束会话（幂等），返回最终快照
    pub async fn end_session(&self, session_id: &str) -> Result<Session> {
        let inner = &self.inner;
        let Some(handle) = inner.handle(session_id).await else {
            let session = inner.store.load(session_id).await?;
            if session.status.is_terminal() {
                return Ok(session);
            }
            return Err(OrchestratorError::NotFound(session_id.to_string()));
        };

        {
            let mut state = handle.state.lock().await;
            if state.session.status.is_terminal() {
                return Ok(state.session.clone());
            }
            if state.closing {
                drop(state);
                handle.finished.cancelled().await;
                return Ok(handle.snapshot().await);
            }
            state.closing = true;
        }

        if inner.settings.session.end_policy == EndPolicy::Drain {
            self.wait_drained(&handle).await;
        }

        let in_flight = {
            let mut state = handle.state.lock().await;
            let st = &mut *state;
            let cancelled = st.queue.cancel_outstanding(&mut st.session, "session_ended");
            if !cancelled.is_empty() {
                inner.commit(&st.session, cancelled).await;
            }
            st.in_flight.clone()
        };

        let exec = match in_flight {
            Some(token) => {
                let grace = inner.settings.session.in_flight_grace();
                match tokio::time::timeout(grace, handle.exec.lock()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        tracing::warn!(
                            session_id,
                            grace_ms = grace.as_millis() as u64,
                            "In-flight action did not finish in time, aborting"
                        );
                        token.cancel();
                        handle.exec.lock().await
                    }
                }
            }
            None => handle.exec.lock().await,
        };

        let session = {
            let mut state = handle.state.lock().await;
            if !state.session.status.is_terminal() {
                inner
                    .terminate(
                        &handle,
                        &mut state,
                        SessionStatus::Ended,
                        EventKind::SessionEnded,
                        "session_ended",
                        Value::Null,
                    )
                    .await;
            }
            state.session.clone()
        };
        drop(exec);

        inner.collaborator.release(session_id).await;
        Ok(session)
    }

    /// 等待队列排空，最长 drain_timeout
    async fn wait_drained(&self, handle: &SessionHandle) {
        let deadline = tokio::time::Instant::now() + self.inner.settings.session.drain_timeout();
        loop {
            let notified = handle.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = handle.state.lock().await;
                if state.queue.is_drained(&state.session) {
                    return;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(session_id = %handle.id, "Drain timed out, cancelling remaining actions");
                return;
            }
        }
    }

    /// 订阅之后发布的事件（单个会话或全部）
    pub async fn subscribe_events(&self, filter: EventFilter) -> Result<EventSubscription> {
        Ok(self.inner.broadcaster.subscribe(filter).await?)
    }

    /// 从事件日志游标之后重放（仅持久化事件传输）
    pub async fn subscribe_events_from(&self, filter: EventFilter, cursor: u64) -> Result<EventSubscription> {
        Ok(self.inner.broadcaster.subscribe_from(filter, cursor).await?)
    }

    /// 内存中的会话与仅存在于存储中的会话，按创建时间排序
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let handles: Vec<Arc<SessionHandle>> = self.inner.sessions.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in &handles {
            sessions.push(handle.snapshot().await);
        }
        for stored in self.inner.store.list().await? {
            if !sessions.iter().any(|s| s.id == stored.id) {
                sessions.push(stored);
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    pub fn event_stats(&self) -> BroadcastStats {
        self.inner.broadcaster.stats()
    }

    pub fn is_event_log_durable(&self) -> bool {
        self.inner.broadcaster.is_durable()
    }

    /// 内存中的存活会话数
    pub async fn live_sessions(&self) -> usize {
        self.inner.sessions.read().await.values().filter(|h| h.is_live()).count()
    }

    /// 停止 worker、看门狗与重试分发；执行中的动作不写回状态，重启后由恢复流程处理
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Flow manager shutting down");
        inner.shutdown.cancel();
        inner.delay_queue.close().await;

        let handles: Vec<Arc<SessionHandle>> = inner.sessions.read().await.values().cloned().collect();
        for handle in handles {
            if let Some(worker) = handle.take_worker().await {
                if let Err(e) = worker.await {
                    tracing::warn!(session_id = %handle.id, "Session worker failed: {}", e);
                }
            }
        }
        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task failed: {}", e);
            }
        }
        inner.broadcaster.shutdown().await;
        tracing::info!("Flow manager stopped");
    }
}
