//! 会话：客户端可见的一个工作单元（动作日志 + 超时 + 事件序号）
//!
//! 由 FlowManager 独占持有，序列化后的快照由 SessionStore 持久化。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::{Action, ActionId};
use super::event::{Event, EventKind};

/// 会话 ID
pub type SessionId = String;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    /// 超过超时时间但仍在宽限期内，可被新的提交唤醒
    Idle,
    TimedOut,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::TimedOut => "timed_out",
            Self::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Ended)
    }

    /// 是否接受新的动作提交
    pub fn accepts_actions(&self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话记录（即持久化布局）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// 无活动超时（毫秒序列化）
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// 按提交顺序排列的动作日志
    #[serde(default)]
    pub actions: Vec<Action>,
    /// 交给协作方的不透明上下文
    #[serde(default)]
    pub context: Value,
    /// 调用方标识（用于按调用方的会话数限制）
    #[serde(default)]
    pub caller: Option<String>,
    /// 最近一次事件序号
    #[serde(default)]
    pub event_seq: u64,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(timeout: Duration, caller: Option<String>, context: Value) -> Self {
        let now = Utc::now();
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            status: SessionStatus::Created,
            created_at: now,
            last_activity_at: now,
            timeout,
            actions: Vec::new(),
            context,
            caller,
            event_seq: 0,
            ended_at: None,
        }
    }

    /// 刷新最后活跃时间
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// 距最后一次活动经过的时间
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn next_action_id(&self) -> ActionId {
        format!("action_{}", self.actions.len() + 1)
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn action_mut(&mut self, id: &str) -> Option<&mut Action> {
        self.actions.iter_mut().find(|a| a.id == id)
    }

    /// 生成下一条事件（分配会话内单调递增的序号）
    pub fn next_event(&mut self, kind: EventKind, payload: Value) -> Event {
        self.event_seq += 1;
        Event::new(&self.id, self.event_seq, kind, payload)
    }

    pub fn pending_count(&self) -> usize {
        self.actions.iter().filter(|a| !a.is_finished()).count()
    }
}

/// Duration <-> 毫秒整数
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
