//! 数据模型：会话、动作、事件

mod action;
mod event;
mod model;

pub use action::{Action, ActionId, ActionKind, ActionStatus};
pub use event::{action_payload, Event, EventFilter, EventKind};
pub use model::{duration_ms, Session, SessionId, SessionStatus};
