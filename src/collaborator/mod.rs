//! 自动化协作方：真正执行单个动作的外部驱动（浏览器等）
//!
//! 编排层只通过 [`AutomationCollaborator`] 与其交互；参数校验由协作方负责，
//! 失败以 [`ActionError`] 的分类返回，由重试策略决定是否重试。

#[cfg(feature = "browser")]
mod chrome;
mod mock;

use async_trait::async_trait;
use serde_json::Value;

#[cfg(feature = "browser")]
pub use chrome::ChromeCollaborator;
pub use mock::{CallRecord, ScriptedCollaborator, ScriptedOutcome};

use crate::core::ActionError;
use crate::session::ActionKind;

/// 单次执行的上下文
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub session_id: String,
    pub action_id: String,
    /// 第几次执行（从 1 开始）
    pub attempt: u32,
    /// 会话创建时给定的不透明上下文
    pub context: Value,
}

#[async_trait]
pub trait AutomationCollaborator: Send + Sync {
    /// 执行一个动作；调用方负责施加超时
    async fn execute(&self, kind: ActionKind, params: &Value, ctx: &ActionContext) -> Result<Value, ActionError>;

    /// 会话进入终态后释放其资源（标签页等）
    async fn release(&self, _session_id: &str) {}
}

/// 读取字符串参数
pub(crate) fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ActionError::invalid_state(format!("Missing parameter: {}", key)))
}
