//! 会话 / 动作状态迁移事件
//!
//! 事件一经发布即不可变；ID 为 `<session_id>:<seq>`，重复投递时观察者可据此去重。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::action::Action;
use super::model::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    SessionIdle,
    SessionResumed,
    ActionQueued,
    ActionStarted,
    ActionSucceeded,
    ActionFailed,
    ActionRetrying,
    ActionAbandoned,
    ActionCancelled,
    SessionTimedOut,
    SessionEnded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionIdle => "session_idle",
            Self::SessionResumed => "session_resumed",
            Self::ActionQueued => "action_queued",
            Self::ActionStarted => "action_started",
            Self::ActionSucceeded => "action_succeeded",
            Self::ActionFailed => "action_failed",
            Self::ActionRetrying => "action_retrying",
            Self::ActionAbandoned => "action_abandoned",
            Self::ActionCancelled => "action_cancelled",
            Self::SessionTimedOut => "session_timed_out",
            Self::SessionEnded => "session_ended",
        }
    }

    /// 会话进入终态的事件
    pub fn is_session_terminal(&self) -> bool {
        matches!(self, Self::SessionTimedOut | Self::SessionEnded)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// 会话内单调递增
    pub seq: u64,
    pub session_id: SessionId,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(session_id: &str, seq: u64, kind: EventKind, payload: Value) -> Self {
        Self {
            id: format!("{session_id}:{seq}"),
            seq,
            session_id: session_id.to_string(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// payload 中的 action_id（动作事件才有）
    pub fn action_id(&self) -> Option<&str> {
        self.payload.get("action_id").and_then(|v| v.as_str())
    }
}

/// 动作事件的公共 payload 字段，extra 中的字段会合并进去
pub fn action_payload(action: &Action, extra: Value) -> Value {
    let mut payload = json!({
        "action_id": action.id,
        "kind": action.kind,
        "status": action.status,
        "attempt": action.attempts,
    });
    if let (Some(base), Value::Object(extra)) = (payload.as_object_mut(), extra) {
        base.extend(extra);
    }
    payload
}

/// 订阅过滤：单个会话或全部
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Session(SessionId),
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Session(id) => &event.session_id == id,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Session(id) => Some(id),
        }
    }
}

impl From<Option<SessionId>> for EventFilter {
    fn from(session_id: Option<SessionId>) -> Self {
        session_id.map(Self::Session).unwrap_or(Self::All)
    }
}
