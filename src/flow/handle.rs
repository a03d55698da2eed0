//! 内存中的会话句柄
//!
//! 每个会话两把锁：`exec` 为单飞执行锁（worker 执行动作期间持有，结束/超时路径终止会话时持有），
//! `state` 为短时状态锁（保护会话记录与队列）。提交只取 `state`，从不等待执行中的动作。
//! 加锁顺序：先 `exec` 后 `state`。

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::ActionQueue;
use crate::session::{Session, SessionId};

pub(crate) struct SessionState {
    pub session: Session,
    pub queue: ActionQueue,
    /// end_session 进行中：拒绝新提交，不再安排重试
    pub closing: bool,
    /// 当前执行中动作的中止令牌
    pub in_flight: Option<CancellationToken>,
}

pub(crate) struct SessionHandle {
    pub id: SessionId,
    pub caller: Option<String>,
    pub exec: Mutex<()>,
    pub state: Mutex<SessionState>,
    /// 有新动作可执行
    pub wake: Notify,
    /// 队列排空（drain 策略等待）
    pub drained: Notify,
    /// 停止 worker（会话终止或进程关闭）
    pub cancel: CancellationToken,
    /// 会话进入终态后取消
    pub finished: CancellationToken,
    live: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new(session: Session, queue: ActionQueue, cancel: CancellationToken) -> Self {
        let live = !session.status.is_terminal();
        Self {
            id: session.id.clone(),
            caller: session.caller.clone(),
            exec: Mutex::new(()),
            state: Mutex::new(SessionState {
                session,
                queue,
                closing: false,
                in_flight: None,
            }),
            wake: Notify::new(),
            drained: Notify::new(),
            cancel,
            finished: CancellationToken::new(),
            live: AtomicBool::new(live),
            worker: Mutex::new(None),
        }
    }

    /// 未进入终态（用于容量统计）
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// 标记终态：停止 worker，唤醒等待结束的调用方
    pub fn mark_finished(&self) {
        self.live.store(false, Ordering::Release);
        self.cancel.cancel();
        self.finished.cancel();
    }

    pub async fn set_worker(&self, worker: JoinHandle<()>) {
        *self.worker.lock().await = Some(worker);
    }

    pub async fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().await.take()
    }

    pub async fn snapshot(&self) -> Session {
        self.state.lock().await.session.clone()
    }
}
