//! 会话 worker 与重试分发
//!
//! 每个会话一个 worker，按 FIFO 顺序逐个执行动作；同一会话同一时刻最多一个动作在执行。
//! 重试退避由延迟队列计时，到期后分发任务把动作放回所属会话队尾并唤醒 worker。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handle::SessionHandle;
use super::manager::FlowInner;
use crate::collaborator::ActionContext;
use crate::config::EndPolicy;
use crate::core::ActionError;
use crate::queue::{DelayedRetry, Next, StartedAction};
use crate::session::{EventKind, SessionStatus};

enum Step {
    /// 立即尝试下一个动作
    Continue,
    /// 等待新动作
    Wait,
    Stop,
}

enum Plan {
    Wait,
    Throttle(Duration),
    Run {
        started: StartedAction,
        abort: CancellationToken,
        context: Value,
    },
}

pub(crate) async fn run(inner: Arc<FlowInner>, handle: Arc<SessionHandle>) {
    tracing::debug!(session_id = %handle.id, "Session worker started");
    loop {
        match step(&inner, &handle).await {
            Step::Continue => continue,
            Step::Stop => break,
            Step::Wait => {}
        }
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            _ = handle.wake.notified() => {}
        }
    }
    tracing::debug!(session_id = %handle.id, "Session worker stopped");
}

async fn step(inner: &FlowInner, handle: &SessionHandle) -> Step {
    let exec = handle.exec.lock().await;

    let plan = {
        let mut state = handle.state.lock().await;
        let st = &mut *state;
        if handle.cancel.is_cancelled() || st.session.status.is_terminal() {
            return Step::Stop;
        }
        match st.queue.next(&mut st.session, Instant::now()) {
            Ok(Next::Idle) => {
                if st.queue.is_drained(&st.session) {
                    handle.drained.notify_waiters();
                }
                Plan::Wait
            }
            Ok(Next::Throttled(wait)) => Plan::Throttle(wait),
            Ok(Next::Start(started)) => {
                let abort = handle.cancel.child_token();
                st.in_flight = Some(abort.clone());

                let mut events = Vec::with_capacity(2);
                if st.session.status == SessionStatus::Idle {
                    st.session.status = SessionStatus::Active;
                    events.push(
                        st.session
                            .next_event(EventKind::SessionResumed, json!({ "action_id": started.action_id })),
                    );
                }
                st.session.touch();
                events.push(started.event.clone());
                inner.commit(&st.session, events).await;

                Plan::Run {
                    started,
                    abort,
                    context: st.session.context.clone(),
                }
            }
            Err(e) => {
                tracing::error!(session_id = %handle.id, "Failed to start next action: {}", e);
                Plan::Wait
            }
        }
    };

    let (started, abort, context) = match plan {
        Plan::Wait => return Step::Wait,
        Plan::Throttle(wait) => {
            drop(exec);
            tracing::debug!(session_id = %handle.id, wait_ms = wait.as_millis() as u64, "Rate limited");
            tokio::select! {
                _ = handle.cancel.cancelled() => return Step::Stop,
                _ = tokio::time::sleep(wait) => return Step::Continue,
            }
        }
        Plan::Run {
            started,
            abort,
            context,
        } => (started, abort, context),
    };

    let ctx = ActionContext {
        session_id: handle.id.clone(),
        action_id: started.action_id.clone(),
        attempt: started.attempt,
        context,
    };
    let limit = inner.settings.queue.action_timeout();
    let call = tokio::time::timeout(limit, inner.collaborator.execute(started.kind, &started.params, &ctx));

    let outcome = tokio::select! {
        result = call => match result {
            Ok(outcome) => outcome,
            Err(_) => Err(ActionError::timeout(format!(
                "{} did not finish within {}ms",
                started.kind,
                limit.as_millis()
            ))),
        },
        _ = abort.cancelled() => {
            if inner.shutdown.is_cancelled() {
                tracing::info!(
                    session_id = %handle.id,
                    action_id = %started.action_id,
                    "Shutting down with action in flight, leaving it for recovery"
                );
                return Step::Stop;
            }
            Err(ActionError::unknown("aborted: session ending"))
        }
    };

    match &outcome {
        Ok(_) => tracing::info!(
            session_id = %handle.id,
            action_id = %started.action_id,
            kind = %started.kind,
            attempt = started.attempt,
            "Action succeeded"
        ),
        Err(e) => tracing::warn!(
            session_id = %handle.id,
            action_id = %started.action_id,
            kind = %started.kind,
            attempt = started.attempt,
            "Action failed: {}",
            e
        ),
    }

    let mut state = handle.state.lock().await;
    let st = &mut *state;
    st.in_flight = None;
    let allow_retry = !st.closing && !inner.shutdown.is_cancelled();
    match st
        .queue
        .complete(&mut st.session, &started.action_id, outcome, allow_retry)
    {
        Ok(completion) => {
            st.session.touch();
            inner.commit(&st.session, completion.events).await;
            if let Some(retry) = completion.retry {
                if let Err(e) = inner.delay_queue.schedule(retry).await {
                    tracing::error!(
                        session_id = %handle.id,
                        action_id = %started.action_id,
                        "Failed to schedule retry, requeueing immediately: {}",
                        e
                    );
                    if let Ok(Some(event)) = st.queue.requeue(&mut st.session, &started.action_id) {
                        inner.commit(&st.session, vec![event]).await;
                    }
                }
            }
        }
        Err(e) => tracing::error!(
            session_id = %handle.id,
            action_id = %started.action_id,
            "Failed to record action outcome: {}",
            e
        ),
    }
    if st.queue.is_drained(&st.session) {
        handle.drained.notify_waiters();
    }
    drop(state);
    drop(exec);
    Step::Continue
}

/// 延迟队列到期的重试放回会话队尾；延迟队列关闭后退出
pub(crate) async fn run_retry_dispatcher(inner: Arc<FlowInner>) {
    while let Some(retry) = inner.delay_queue.next_due().await {
        requeue_due(&inner, &retry).await;
        if let Err(e) = inner.delay_queue.ack(&retry).await {
            tracing::warn!(
                session_id = %retry.session_id,
                action_id = %retry.action_id,
                "Failed to ack retry: {}",
                e
            );
        }
    }
    tracing::debug!("Retry dispatcher stopped");
}

async fn requeue_due(inner: &FlowInner, retry: &DelayedRetry) {
    let Some(handle) = inner.handle(&retry.session_id).await else {
        tracing::debug!(session_id = %retry.session_id, "Retry for unknown session dropped");
        return;
    };
    {
        let mut state = handle.state.lock().await;
        let st = &mut *state;
        // drain 期间已排期的重试照常放回队列
        let draining = st.closing && inner.settings.session.end_policy == EndPolicy::Drain;
        if st.session.status.is_terminal() || (st.closing && !draining) {
            return;
        }
        match st.queue.requeue(&mut st.session, &retry.action_id) {
            Ok(Some(event)) => inner.commit(&st.session, vec![event]).await,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    session_id = %retry.session_id,
                    action_id = %retry.action_id,
                    "Retry requeue failed: {}",
                    e
                );
                return;
            }
        }
    }
    handle.wake.notify_one();
}
