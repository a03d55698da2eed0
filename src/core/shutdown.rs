//! 进程级关闭信号
//!
//! 二进制入口用它监听 Ctrl+C / SIGTERM，然后调用 `FlowManager::shutdown`。
//! 关闭只停止 worker，不改写执行中的会话状态，重启后由恢复流程接管。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 主任务自行结束（脚本执行完毕等）
    Completed,
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason_tx: Arc::new(reason_tx),
        }
    }

    /// 子 token：取消传播给所有派生任务
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.reason_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason_tx.borrow().clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C / SIGTERM 处理
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, shutting down");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行 app 直到它结束或收到关闭信号，之后执行 cleanup（带超时）
pub async fn run_until_shutdown<F, C, Fut>(
    manager: &ShutdownManager,
    app: F,
    cleanup: C,
    cleanup_timeout: std::time::Duration,
) where
    F: Future<Output = ()>,
    C: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    tokio::select! {
        _ = app => {
            tracing::debug!("Application finished");
            manager.shutdown(ShutdownReason::Completed);
        }
        _ = manager.wait_for_shutdown() => {
            tracing::info!(reason = ?manager.reason(), "Shutdown signal received");
        }
    }

    if tokio::time::timeout(cleanup_timeout, cleanup()).await.is_err() {
        tracing::warn!(
            "Cleanup did not finish within {}ms",
            cleanup_timeout.as_millis()
        );
    }
}
