//! 会话流程管理：生命周期、逐个执行的 worker、重试分发与超时看门狗

mod handle;
mod manager;
mod watchdog;
mod worker;

pub use manager::{FlowManager, FlowManagerBuilder, SessionOptions};
