//! 单会话动作队列
//!
//! 纯状态机：所有方法都作用于调用方持有的 `&mut Session`（调用方负责加锁），
//! 每次状态迁移返回恰好一条事件，由调用方先发布、再保存快照。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::delay::DelayedRetry;
use super::rate_limit::RollingWindow;
use super::retry::{AbandonReason, RetryDecision, RetryPolicy};
use crate::core::{ActionError, OrchestratorError, Result};
use crate::session::{
    action_payload, Action, ActionId, ActionKind, ActionStatus, Event, EventKind, Session,
};

/// `next` 的结果
#[derive(Debug)]
pub enum Next {
    /// 队列为空
    Idle,
    /// 限流中，需等待给定时长
    Throttled(Duration),
    /// 队头动作已进入 running
    Start(StartedAction),
}

/// 已开始执行的动作（交给 worker 调用协作方）
#[derive(Debug, Clone)]
pub struct StartedAction {
    pub action_id: ActionId,
    pub kind: ActionKind,
    pub params: Value,
    pub attempt: u32,
    pub event: Event,
}

/// 一次执行结束后的迁移结果
#[derive(Debug, Default)]
pub struct Completion {
    pub events: Vec<Event>,
    /// 需要交给延迟队列的重试
    pub retry: Option<DelayedRetry>,
}

/// 重启恢复得到的队列及需要补发的事件 / 重新调度的重试
pub struct Restored {
    pub queue: ActionQueue,
    pub events: Vec<Event>,
    pub retries: Vec<DelayedRetry>,
}

pub struct ActionQueue {
    fifo: VecDeque<ActionId>,
    limiter: RollingWindow,
    policy: Arc<RetryPolicy>,
    in_flight: Option<ActionId>,
}

impl ActionQueue {
    pub fn new(policy: Arc<RetryPolicy>, limiter: RollingWindow) -> Self {
        Self {
            fifo: VecDeque::new(),
            limiter,
            policy,
            in_flight: None,
        }
    }

    /// 按持久化记录重建队列
    ///
    /// queued 动作按 `queued_at` 恢复顺序；running 动作视为被中断（以 unknown 失败后交给
    /// 重试策略）；retrying 动作按原 `next_attempt_at` 重新调度。
    pub fn restore(session: &mut Session, policy: Arc<RetryPolicy>, limiter: RollingWindow) -> Restored {
        let mut queue = Self::new(policy, limiter);
        let mut events = Vec::new();
        let mut retries = Vec::new();

        let interrupted: Vec<ActionId> = session
            .actions
            .iter()
            .filter(|a| a.status == ActionStatus::Running)
            .map(|a| a.id.clone())
            .collect();
        for action_id in interrupted {
            queue.in_flight = Some(action_id.clone());
            let outcome = Err(ActionError::unknown("interrupted by restart"));
            match queue.complete(session, &action_id, outcome, true) {
                Ok(completion) => {
                    events.extend(completion.events);
                    retries.extend(completion.retry);
                }
                Err(e) => tracing::warn!(
                    session_id = %session.id,
                    action_id = %action_id,
                    "Failed to recover interrupted action: {}",
                    e
                ),
            }
        }

        let mut queued: Vec<&Action> = session
            .actions
            .iter()
            .filter(|a| a.status == ActionStatus::Queued)
            .collect();
        queued.sort_by_key(|a| a.queued_at);
        queue.fifo = queued.into_iter().map(|a| a.id.clone()).collect();

        for action in &session.actions {
            if action.status == ActionStatus::Retrying && !retries.iter().any(|r| r.action_id == action.id) {
                retries.push(DelayedRetry {
                    session_id: session.id.clone(),
                    action_id: action.id.clone(),
                    due_at: action.next_attempt_at.unwrap_or_else(Utc::now),
                });
            }
        }

        Restored {
            queue,
            events,
            retries,
        }
    }

    /// 提交新动作（分配 ID，追加到队尾）
    pub fn enqueue(&mut self, session: &mut Session, kind: ActionKind, params: Value) -> (ActionId, Event) {
        let action = Action::new(session.next_action_id(), kind, params);
        let action_id = action.id.clone();
        let payload = action_payload(&action, json!({ "params": action.params }));
        session.actions.push(action);
        self.fifo.push_back(action_id.clone());
        let event = session.next_event(EventKind::ActionQueued, payload);
        (action_id, event)
    }

    /// 退避结束后重新入队（retrying → queued）；动作已不在 retrying 时返回 None
    pub fn requeue(&mut self, session: &mut Session, action_id: &str) -> Result<Option<Event>> {
        let action = session
            .action_mut(action_id)
            .ok_or_else(|| OrchestratorError::NotFound(action_id.to_string()))?;
        if action.status != ActionStatus::Retrying {
            return Ok(None);
        }
        action.transition(ActionStatus::Queued)?;
        action.queued_at = Utc::now();
        action.next_attempt_at = None;
        let payload = action_payload(action, json!({ "requeued": true }));
        self.fifo.push_back(action_id.to_string());
        Ok(Some(session.next_event(EventKind::ActionQueued, payload)))
    }

    /// 取队头动作开始执行；已有动作在执行时返回 Idle
    pub fn next(&mut self, session: &mut Session, now: Instant) -> Result<Next> {
        if self.in_flight.is_some() {
            return Ok(Next::Idle);
        }
        loop {
            let Some(action_id) = self.fifo.front().cloned() else {
                return Ok(Next::Idle);
            };
            let queued = session
                .action(&action_id)
                .map(|a| a.status == ActionStatus::Queued)
                .unwrap_or(false);
            if !queued {
                self.fifo.pop_front();
                continue;
            }
            if let Err(wait) = self.limiter.check(now) {
                return Ok(Next::Throttled(wait));
            }
            self.fifo.pop_front();

            let action = session
                .action_mut(&action_id)
                .ok_or_else(|| OrchestratorError::NotFound(action_id.clone()))?;
            action.transition(ActionStatus::Running)?;
            action.attempts += 1;
            action.last_attempt_at = Some(Utc::now());
            let (kind, params, attempt) = (action.kind, action.params.clone(), action.attempts);
            let payload = action_payload(action, Value::Null);

            self.limiter.record(now);
            self.in_flight = Some(action_id.clone());
            return Ok(Next::Start(StartedAction {
                action_id,
                kind,
                params,
                attempt,
                event: session.next_event(EventKind::ActionStarted, payload),
            }));
        }
    }

    /// 记录执行结果；失败时交给重试策略（allow_retry 为 false 时直接放弃）
    pub fn complete(
        &mut self,
        session: &mut Session,
        action_id: &str,
        outcome: std::result::Result<Value, ActionError>,
        allow_retry: bool,
    ) -> Result<Completion> {
        if self.in_flight.as_deref() == Some(action_id) {
            self.in_flight = None;
        }
        let session_id = session.id.clone();
        let policy = Arc::clone(&self.policy);
        let action = session
            .action_mut(action_id)
            .ok_or_else(|| OrchestratorError::NotFound(action_id.to_string()))?;

        let error = match outcome {
            Ok(result) => {
                action.transition(ActionStatus::Succeeded)?;
                action.result = Some(result.clone());
                action.last_error = None;
                let payload = action_payload(action, json!({ "result": result }));
                return Ok(Completion {
                    events: vec![session.next_event(EventKind::ActionSucceeded, payload)],
                    retry: None,
                });
            }
            Err(error) => error,
        };

        action.transition(ActionStatus::Failed)?;
        action.last_error = Some(error.clone());
        let failed = action_payload(action, json!({ "error": error }));

        let decision = if allow_retry {
            policy.decide(action.attempts, error.kind)
        } else {
            RetryDecision::Abandon {
                reason: AbandonReason::SessionClosing,
            }
        };

        let mut completion = Completion::default();
        match decision {
            RetryDecision::Retry { delay } => {
                action.transition(ActionStatus::Retrying)?;
                let due_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                action.next_attempt_at = Some(due_at);
                let retrying = action_payload(
                    action,
                    json!({ "delay_ms": delay.as_millis() as u64, "next_attempt_at": due_at }),
                );
                completion.events.push(session.next_event(EventKind::ActionFailed, failed));
                completion.events.push(session.next_event(EventKind::ActionRetrying, retrying));
                completion.retry = Some(DelayedRetry {
                    session_id,
                    action_id: action_id.to_string(),
                    due_at,
                });
            }
            RetryDecision::Abandon { reason } => {
                action.transition(ActionStatus::Abandoned)?;
                let abandoned = action_payload(action, json!({ "reason": reason }));
                completion.events.push(session.next_event(EventKind::ActionFailed, failed));
                completion.events.push(session.next_event(EventKind::ActionAbandoned, abandoned));
            }
        }
        Ok(completion)
    }

    /// 取消所有尚未开始的动作（queued 与等待重试的）
    pub fn cancel_outstanding(&mut self, session: &mut Session, reason: &str) -> Vec<Event> {
        self.fifo.clear();
        let mut payloads = Vec::new();
        for action in session.actions.iter_mut() {
            if matches!(action.status, ActionStatus::Queued | ActionStatus::Retrying)
                && action.transition(ActionStatus::Cancelled).is_ok()
            {
                action.next_attempt_at = None;
                payloads.push(action_payload(action, json!({ "reason": reason })));
            }
        }
        payloads
            .into_iter()
            .map(|payload| session.next_event(EventKind::ActionCancelled, payload))
            .collect()
    }

    /// 没有任何未完结动作
    pub fn is_drained(&self, session: &Session) -> bool {
        self.in_flight.is_none() && session.pending_count() == 0
    }
}
