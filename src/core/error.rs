//! 编排层错误类型
//!
//! 会话 API 只向调用方暴露 NotFound / InvalidState / Capacity；协作方（浏览器驱动）的失败
//! 在动作队列内部被重试或放弃，存储与广播的失败在内部重试后降级为日志。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 协作方执行失败的分类（决定是否重试）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    /// 执行超时（包括队列施加的动作超时）
    Timeout,
    /// 目标不可达（浏览器未启动、页面崩溃等）
    TargetUnavailable,
    /// 目标状态不允许该动作（元素不存在、参数非法）
    InvalidState,
    Unknown,
}

impl ActionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::TargetUnavailable => "target_unavailable",
            Self::InvalidState => "invalid_state",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ActionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 协作方返回的执行错误
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::Timeout, message)
    }

    pub fn target_unavailable(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::TargetUnavailable, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::InvalidState, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::Unknown, message)
    }
}

/// 存储 / 广播 / 延迟队列后端错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 进程内传输不保留历史，无法从游标重放
    #[error("Replay is not supported by the {0} transport")]
    ReplayUnsupported(&'static str),

    #[error("Transport closed")]
    Closed,

    #[cfg(feature = "async-sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),
}

/// 会话编排错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state for {id}: {status} does not allow {operation}")]
    InvalidState {
        id: String,
        status: String,
        operation: String,
    },

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl OrchestratorError {
    pub fn invalid_state(
        id: impl Into<String>,
        status: impl std::fmt::Display,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            status: status.to_string(),
            operation: operation.into(),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Transport(TransportError::Serialization(e))
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_display() {
        let err = ActionError::timeout("navigate took too long");
        assert_eq!(err.to_string(), "timeout: navigate took too long");
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ActionErrorKind::TargetUnavailable).unwrap();
        assert_eq!(json, "\"target_unavailable\"");
        let kind: ActionErrorKind = serde_json::from_str("\"invalid_state\"").unwrap();
        assert_eq!(kind, ActionErrorKind::InvalidState);
    }

    #[test]
    fn test_invalid_state_message() {
        let err = OrchestratorError::invalid_state("session_1", "ended", "submit_action");
        assert_eq!(
            err.to_string(),
            "Invalid state for session_1: ended does not allow submit_action"
        );
    }
}
