//! 核心层：错误类型与关闭信号

pub mod error;
pub mod shutdown;

pub use error::{ActionError, ActionErrorKind, OrchestratorError, Result, TransportError};
pub use shutdown::{run_until_shutdown, ShutdownManager, ShutdownReason};
