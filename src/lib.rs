//! Stagehand - 演示会话编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **session**: 会话、动作与事件的数据模型
//! - **queue**: 单会话 FIFO 队列、滚动窗口限流、重试策略与延迟队列
//! - **store**: 带 TTL 的会话存储（内存 / SQLite）
//! - **broadcast**: 事件广播（进程内 / SQLite 事件日志）
//! - **collaborator**: 执行动作的自动化协作方（脚本化 / Headless Chrome）
//! - **flow**: FlowManager，会话生命周期与超时看门狗
//! - **web**: HTTP API 与 SSE 事件流（feature `web`）

pub mod broadcast;
pub mod collaborator;
pub mod config;
pub mod core;
pub mod flow;
pub mod observability;
pub mod queue;
pub mod session;
pub mod store;
#[cfg(feature = "web")]
pub mod web;

pub use crate::core::{ActionError, ActionErrorKind, OrchestratorError, Result};
pub use flow::{FlowManager, FlowManagerBuilder, SessionOptions};
pub use session::{Action, ActionKind, ActionStatus, Event, EventFilter, EventKind, Session, SessionStatus};
