//! 脚本化协作方（测试与无浏览器的演练运行）
//!
//! 每种动作可预置一串结果，按调用顺序逐个消费；用完后使用默认结果。

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ActionContext, AutomationCollaborator};
use crate::core::ActionError;
use crate::session::ActionKind;

/// 预置结果
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed(Value),
    Fail(ActionError),
    /// 等待给定时长后成功
    Sleep(Duration),
    /// 永不返回（用于测试超时和中止）
    Hang,
}

/// 一次调用记录
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub session_id: String,
    pub action_id: String,
    pub kind: ActionKind,
    pub attempt: u32,
    pub started_at: Instant,
    /// 被中止的调用没有结束时间
    pub finished_at: Option<Instant>,
}

pub struct ScriptedCollaborator {
    default: ScriptedOutcome,
    delay: Duration,
    scripts: Mutex<HashMap<ActionKind, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<Vec<CallRecord>>,
    released: Mutex<HashSet<String>>,
}

impl ScriptedCollaborator {
    fn with_default(default: ScriptedOutcome) -> Self {
        Self {
            default,
            delay: Duration::ZERO,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            released: Mutex::new(HashSet::new()),
        }
    }

    /// 所有动作默认成功
    pub fn succeeding() -> Self {
        Self::with_default(ScriptedOutcome::Succeed(Value::Null))
    }

    /// 所有动作默认以给定错误失败
    pub fn failing(error: ActionError) -> Self {
        Self::with_default(ScriptedOutcome::Fail(error))
    }

    /// 每次调用前的固定耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 为某种动作预置结果序列
    pub fn script(mut self, kind: ActionKind, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        self.scripts
            .get_mut()
            .entry(kind)
            .or_default()
            .extend(outcomes);
        self
    }

    pub async fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn was_released(&self, session_id: &str) -> bool {
        self.released.lock().await.contains(session_id)
    }

    async fn next_outcome(&self, kind: ActionKind) -> ScriptedOutcome {
        self.scripts
            .lock()
            .await
            .get_mut(&kind)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl AutomationCollaborator for ScriptedCollaborator {
    async fn execute(&self, kind: ActionKind, params: &Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let index = {
            let mut calls = self.calls.lock().await;
            calls.push(CallRecord {
                session_id: ctx.session_id.clone(),
                action_id: ctx.action_id.clone(),
                kind,
                attempt: ctx.attempt,
                started_at: Instant::now(),
                finished_at: None,
            });
            calls.len() - 1
        };
        tracing::debug!(
            session_id = %ctx.session_id,
            action_id = %ctx.action_id,
            kind = %kind,
            attempt = ctx.attempt,
            "scripted execute"
        );

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match self.next_outcome(kind).await {
            ScriptedOutcome::Succeed(Value::Null) => Ok(json!({ "kind": kind, "params": params })),
            ScriptedOutcome::Succeed(value) => Ok(value),
            ScriptedOutcome::Fail(error) => Err(error),
            ScriptedOutcome::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!({ "kind": kind, "slept_ms": duration.as_millis() as u64 }))
            }
            ScriptedOutcome::Hang => std::future::pending().await,
        };

        if let Some(call) = self.calls.lock().await.get_mut(index) {
            call.finished_at = Some(Instant::now());
        }
        result
    }

    async fn release(&self, session_id: &str) {
        self.released.lock().await.insert(session_id.to_string());
    }
}
