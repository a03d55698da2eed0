//! 动作：提交到会话队列的单个离散操作
//!
//! 状态只由动作队列推进，合法迁移见 [`ActionStatus::can_transition_to`]。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ActionError, OrchestratorError};

/// 动作 ID（会话内唯一，提交时分配）
pub type ActionId = String;

/// 动作类型（封闭枚举；队列从不按类型分支，只有协作方会）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Scroll,
    Wait,
    GoBack,
    Refresh,
    RightClick,
    KeyboardShortcut,
    Zoom,
    Screenshot,
    Hover,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Type => "type",
            Self::Scroll => "scroll",
            Self::Wait => "wait",
            Self::GoBack => "go_back",
            Self::Refresh => "refresh",
            Self::RightClick => "right_click",
            Self::KeyboardShortcut => "keyboard_shortcut",
            Self::Zoom => "zoom",
            Self::Screenshot => "screenshot",
            Self::Hover => "hover",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 动作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// 在 FIFO 中等待执行
    Queued,
    /// 正在由协作方执行
    Running,
    Succeeded,
    /// 本次尝试失败，等待重试策略裁决
    Failed,
    /// 等待退避延迟后重新入队
    Retrying,
    /// 重试耗尽或错误不可重试
    Abandoned,
    /// 会话结束/超时时尚未开始的动作
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Abandoned => "abandoned",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Abandoned | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Failed, Retrying)
                | (Failed, Abandoned)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个动作（会话持久化记录的一部分）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    /// 类型相关参数，由协作方校验
    #[serde(default)]
    pub params: Value,
    pub status: ActionStatus,
    /// 已开始的执行次数
    pub attempts: u32,
    /// 首次提交时间
    pub enqueued_at: DateTime<Utc>,
    /// 最近一次进入 FIFO 的时间（重启后按此恢复队列顺序）
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub last_error: Option<ActionError>,
}

impl Action {
    pub fn new(id: ActionId, kind: ActionKind, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            params,
            status: ActionStatus::Queued,
            attempts: 0,
            enqueued_at: now,
            queued_at: now,
            last_attempt_at: None,
            next_attempt_at: None,
            result: None,
            last_error: None,
        }
    }

    /// 按状态机推进；非法迁移返回 InvalidState
    pub fn transition(&mut self, next: ActionStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::invalid_state(
                &self.id,
                self.status,
                format!("transition to {next}"),
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut action = Action::new("action_1".into(), ActionKind::Navigate, Value::Null);
        assert_eq!(action.status, ActionStatus::Queued);
        action.transition(ActionStatus::Running).unwrap();
        action.transition(ActionStatus::Succeeded).unwrap();
        assert!(action.is_finished());
    }

    #[test]
    fn test_retry_cycle_transitions() {
        let mut action = Action::new("action_1".into(), ActionKind::Click, Value::Null);
        for next in [
            ActionStatus::Running,
            ActionStatus::Failed,
            ActionStatus::Retrying,
            ActionStatus::Queued,
            ActionStatus::Running,
            ActionStatus::Failed,
            ActionStatus::Abandoned,
        ] {
            action.transition(next).unwrap();
        }
        assert_eq!(action.status, ActionStatus::Abandoned);
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut action = Action::new("action_1".into(), ActionKind::Type, Value::Null);
        assert!(action.transition(ActionStatus::Succeeded).is_err());
        assert!(action.transition(ActionStatus::Failed).is_err());
        assert_eq!(action.status, ActionStatus::Queued);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            ActionStatus::Succeeded,
            ActionStatus::Abandoned,
            ActionStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(ActionStatus::Queued));
            assert!(!terminal.can_transition_to(ActionStatus::Running));
        }
    }

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&ActionKind::KeyboardShortcut).unwrap();
        assert_eq!(json, "\"keyboard_shortcut\"");
        let kind: ActionKind = serde_json::from_str("\"go_back\"").unwrap();
        assert_eq!(kind, ActionKind::GoBack);
        assert_eq!(ActionKind::RightClick.to_string(), "right_click");
    }
}
