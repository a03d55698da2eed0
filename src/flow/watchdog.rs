//! 超时看门狗：周期扫描会话，处理 idle / timed_out 迁移并回收终态会话

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::time::MissedTickBehavior;

use super::handle::SessionHandle;
use super::manager::FlowInner;
use crate::session::{EventKind, SessionStatus};

pub(crate) async fn run(inner: Arc<FlowInner>) {
    let mut ticker = tokio::time::interval(inner.settings.session.watchdog_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => sweep(&inner).await,
        }
    }
    tracing::debug!("Watchdog stopped");
}

/// 扫描一轮；执行中的会话跳过（动作完成时会刷新活动时间）
pub(crate) async fn sweep(inner: &FlowInner) {
    let handles: Vec<Arc<SessionHandle>> = inner.sessions.read().await.values().cloned().collect();
    let now = Utc::now();
    let retention = inner.settings.session.terminal_retention();
    let grace = inner.settings.session.idle_grace();
    let mut evict = Vec::new();

    for handle in handles {
        if !handle.is_live() {
            let state = handle.state.lock().await;
            let expired = state
                .session
                .ended_at
                .map(|ended| (now - ended).to_std().unwrap_or_default() >= retention)
                .unwrap_or(false);
            if expired {
                evict.push(handle.id.clone());
            }
            continue;
        }

        let Ok(exec) = handle.exec.try_lock() else {
            continue;
        };
        let mut state = handle.state.lock().await;
        let st = &mut *state;
        if st.closing || st.session.status.is_terminal() {
            continue;
        }

        let idle = st.session.idle_for(now);
        let timeout = st.session.timeout;
        let timed_out = match st.session.status {
            SessionStatus::Created | SessionStatus::Active if idle > timeout => {
                if grace.is_zero() {
                    true
                } else {
                    st.session.status = SessionStatus::Idle;
                    let event = st.session.next_event(
                        EventKind::SessionIdle,
                        json!({ "idle_ms": idle.as_millis() as u64, "grace_ms": grace.as_millis() as u64 }),
                    );
                    inner.commit(&st.session, vec![event]).await;
                    tracing::info!(session_id = %handle.id, "Session idle");
                    false
                }
            }
            SessionStatus::Idle => idle > timeout + grace,
            _ => false,
        };
        if !timed_out {
            continue;
        }

        tracing::info!(
            session_id = %handle.id,
            idle_ms = idle.as_millis() as u64,
            "Session timed out"
        );
        inner
            .terminate(
                &handle,
                st,
                SessionStatus::TimedOut,
                EventKind::SessionTimedOut,
                "session_timed_out",
                json!({ "idle_ms": idle.as_millis() as u64 }),
            )
            .await;
        drop(state);
        drop(exec);
        inner.collaborator.release(&handle.id).await;
    }

    if !evict.is_empty() {
        let mut sessions = inner.sessions.write().await;
        for id in &evict {
            sessions.remove(id);
        }
        tracing::debug!("Evicted {} finished sessions from memory", evict.len());
    }
}
