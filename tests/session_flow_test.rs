//! 会话编排集成测试：顺序执行、限流、重试、超时、晚到订阅者与重启恢复

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use stagehand::collaborator::{ScriptedCollaborator, ScriptedOutcome};
use stagehand::config::AppConfig;
use stagehand::store::{MemoryKv, SessionStore};
use stagehand::{
    ActionError, ActionKind, ActionStatus, Event, EventFilter, EventKind, FlowManager, OrchestratorError,
    SessionStatus,
};

fn fast_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.session.watchdog_interval_ms = 10;
    cfg.session.in_flight_grace_ms = 50;
    cfg.retry.base_delay_ms = 10;
    cfg.retry.max_delay_ms = 50;
    cfg.retry.jitter = 0.0;
    cfg
}

async fn flow_with(cfg: AppConfig, collaborator: Arc<ScriptedCollaborator>) -> FlowManager {
    FlowManager::builder(collaborator).config(cfg).build().await.unwrap()
}

async fn wait_action(flow: &FlowManager, session_id: &str, action_id: &str, status: ActionStatus) {
    for _ in 0..300 {
        let session = flow.get_status(session_id).await.unwrap();
        if session.action(action_id).map(|a| a.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {}", action_id, status);
}

async fn wait_session(flow: &FlowManager, session_id: &str, status: SessionStatus) {
    for _ in 0..300 {
        if flow.get_status(session_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached {}", status);
}

/// 收集事件直到出现给定类型（含该事件）
async fn collect_until(sub: &mut stagehand::broadcast::EventSubscription, last: EventKind) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        let done = event.kind == last;
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn test_actions_run_in_fifo_order_one_at_a_time() {
    let collaborator = Arc::new(ScriptedCollaborator::succeeding().with_delay(Duration::from_millis(15)));
    let flow = flow_with(fast_config(), collaborator.clone()).await;
    let session = flow.start_session(Duration::from_secs(30)).await.unwrap();

    let kinds = [ActionKind::Navigate, ActionKind::Click, ActionKind::Type, ActionKind::Screenshot];
    for kind in kinds {
        flow.submit_action(&session.id, kind, json!({"selector": "#x", "url": "https://example.com", "text": "hi"}))
            .await
            .unwrap();
    }
    wait_action(&flow, &session.id, "action_4", ActionStatus::Succeeded).await;

    let calls = collaborator.calls().await;
    let executed: Vec<ActionKind> = calls.iter().map(|c| c.kind).collect();
    assert_eq!(executed, kinds);
    for pair in calls.windows(2) {
        let finished = pair[0].finished_at.expect("call finished");
        assert!(pair[1].started_at >= finished, "actions overlapped");
    }
}

#[tokio::test]
async fn test_rate_limit_spaces_out_action_starts() {
    let mut cfg = fast_config();
    cfg.queue.rate_limit_max = 2;
    cfg.queue.rate_limit_window_ms = 200;
    let collaborator = Arc::new(ScriptedCollaborator::succeeding());
    let flow = flow_with(cfg, collaborator.clone()).await;
    let session = flow.start_session(Duration::from_secs(30)).await.unwrap();

    for _ in 0..3 {
        flow.submit_action(&session.id, ActionKind::Scroll, json!({"y": 100}))
            .await
            .unwrap();
    }
    wait_action(&flow, &session.id, "action_3", ActionStatus::Succeeded).await;

    let calls = collaborator.calls().await;
    assert_eq!(calls.len(), 3);
    let spacing = calls[2].started_at - calls[0].started_at;
    assert!(spacing >= Duration::from_millis(190), "third start after {:?}", spacing);
}

#[tokio::test]
async fn test_retries_then_abandons_with_full_event_trail() {
    let mut cfg = fast_config();
    cfg.retry.max_attempts = 3;
    let collaborator = Arc::new(ScriptedCollaborator::failing(ActionError::target_unavailable(
        "connection refused",
    )));
    let flow = flow_with(cfg, collaborator.clone()).await;
    let session = flow.start_session(Duration::from_secs(30)).await.unwrap();
    let mut sub = flow
        .subscribe_events(EventFilter::Session(session.id.clone()))
        .await
        .unwrap();

    flow.submit_action(&session.id, ActionKind::Navigate, json!({"url": "https://down.example"}))
        .await
        .unwrap();
    let events = collect_until(&mut sub, EventKind::ActionAbandoned).await;

    let count = |kind: EventKind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EventKind::ActionStarted), 3);
    assert_eq!(count(EventKind::ActionFailed), 3);
    assert_eq!(count(EventKind::ActionRetrying), 2);
    assert_eq!(count(EventKind::ActionAbandoned), 1);
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

    // base 10ms，倍数 2，无抖动
    let delays: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == EventKind::ActionRetrying)
        .filter_map(|e| e.payload["delay_ms"].as_u64())
        .collect();
    assert_eq!(delays, vec![10, 20]);

    let status = flow.get_status(&session.id).await.unwrap();
    let action = status.action("action_1").unwrap();
    assert_eq!(action.status, ActionStatus::Abandoned);
    assert_eq!(action.attempts, 3);
    assert_eq!(collaborator.call_count().await, 3);
    assert_eq!(status.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_timeout_cancels_pending_retry() {
    let mut cfg = fast_config();
    cfg.retry.base_delay_ms = 10_000;
    cfg.retry.max_delay_ms = 10_000;
    let collaborator = Arc::new(ScriptedCollaborator::failing(ActionError::timeout("page load")));
    let flow = flow_with(cfg, collaborator.clone()).await;
    let session = flow.start_session(Duration::from_millis(100)).await.unwrap();

    flow.submit_action(&session.id, ActionKind::Navigate, json!({"url": "https://slow.example"}))
        .await
        .unwrap();
    flow.submit_action(&session.id, ActionKind::Click, json!({"selector": "#next"}))
        .await
        .unwrap();
    wait_session(&flow, &session.id, SessionStatus::TimedOut).await;

    let status = flow.get_status(&session.id).await.unwrap();
    assert_eq!(status.action("action_1").unwrap().status, ActionStatus::Cancelled);
    assert!(status.action("action_1").unwrap().next_attempt_at.is_none());
    assert!(status.actions.iter().all(|a| a.status.is_terminal()));
    assert!(collaborator.was_released(&session.id).await);

    let err = flow
        .submit_action(&session.id, ActionKind::Click, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState { .. }));
}

#[tokio::test]
async fn test_timeout_cancels_throttled_action_and_fires_once() {
    let mut cfg = fast_config();
    cfg.queue.rate_limit_max = 1;
    cfg.queue.rate_limit_window_ms = 10_000;
    let flow = flow_with(cfg, Arc::new(ScriptedCollaborator::succeeding())).await;
    let session = flow.start_session(Duration::from_millis(150)).await.unwrap();
    let mut sub = flow
        .subscribe_events(EventFilter::Session(session.id.clone()))
        .await
        .unwrap();

    flow.submit_action(&session.id, ActionKind::Wait, json!({"ms": 1}))
        .await
        .unwrap();
    flow.submit_action(&session.id, ActionKind::Click, json!({"selector": "#later"}))
        .await
        .unwrap();
    let mut events = collect_until(&mut sub, EventKind::SessionTimedOut).await;

    // 再等几轮看门狗扫描，不应出现第二个超时事件
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
        events.push(event);
    }
    let timeouts = events.iter().filter(|e| e.kind == EventKind::SessionTimedOut).count();
    assert_eq!(timeouts, 1);

    let status = flow.get_status(&session.id).await.unwrap();
    assert_eq!(status.status, SessionStatus::TimedOut);
    assert_eq!(status.action("action_1").unwrap().status, ActionStatus::Succeeded);
    let throttled = status.action("action_2").unwrap();
    assert_eq!(throttled.status, ActionStatus::Cancelled);
    assert_eq!(throttled.attempts, 0);
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let flow = flow_with(fast_config(), Arc::new(ScriptedCollaborator::succeeding())).await;
    let session = flow.start_session(Duration::from_secs(30)).await.unwrap();
    flow.submit_action(&session.id, ActionKind::Wait, json!({"ms": 1}))
        .await
        .unwrap();
    wait_action(&flow, &session.id, "action_1", ActionStatus::Succeeded).await;

    let mut late = flow
        .subscribe_events(EventFilter::Session(session.id.clone()))
        .await
        .unwrap();
    flow.end_session(&session.id).await.unwrap();

    let first = late.recv().await.unwrap();
    assert_eq!(first.kind, EventKind::SessionEnded);
}

#[tokio::test]
async fn test_filtered_subscription_only_sees_its_session() {
    let flow = flow_with(fast_config(), Arc::new(ScriptedCollaborator::succeeding())).await;
    let a = flow.start_session(Duration::from_secs(30)).await.unwrap();
    let b = flow.start_session(Duration::from_secs(30)).await.unwrap();
    let mut sub_a = flow
        .subscribe_events(EventFilter::Session(a.id.clone()))
        .await
        .unwrap();

    flow.submit_action(&b.id, ActionKind::Wait, json!({"ms": 1})).await.unwrap();
    flow.submit_action(&a.id, ActionKind::Wait, json!({"ms": 1})).await.unwrap();
    flow.end_session(&a.id).await.unwrap();

    let events = collect_until(&mut sub_a, EventKind::SessionEnded).await;
    assert!(events.iter().all(|e| e.session_id == a.id));
}

#[tokio::test]
async fn test_global_capacity() {
    let mut cfg = fast_config();
    cfg.session.max_sessions = Some(2);
    let flow = flow_with(cfg, Arc::new(ScriptedCollaborator::succeeding())).await;

    let first = flow.start_session(Duration::from_secs(30)).await.unwrap();
    flow.start_session(Duration::from_secs(30)).await.unwrap();
    assert!(matches!(
        flow.start_session(Duration::from_secs(30)).await,
        Err(OrchestratorError::Capacity(_))
    ));

    flow.end_session(&first.id).await.unwrap();
    flow.start_session(Duration::from_secs(30)).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_end_calls_agree() {
    let collaborator = Arc::new(ScriptedCollaborator::succeeding().with_delay(Duration::from_millis(30)));
    let flow = flow_with(fast_config(), collaborator).await;
    let session = flow.start_session(Duration::from_secs(30)).await.unwrap();
    flow.submit_action(&session.id, ActionKind::Click, json!({"selector": "#a"}))
        .await
        .unwrap();

    let (a, b) = tokio::join!(flow.end_session(&session.id), flow.end_session(&session.id));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.status, SessionStatus::Ended);
    assert_eq!(a.event_seq, b.event_seq);
    assert_eq!(a.ended_at, b.ended_at);
}

#[tokio::test]
async fn test_restart_recovers_interrupted_and_queued_actions() {
    let kv = Arc::new(MemoryKv::new());
    let store = || SessionStore::new(kv.clone(), Duration::from_secs(60), Duration::from_secs(60));

    let hanging = Arc::new(ScriptedCollaborator::succeeding().script(ActionKind::Navigate, [ScriptedOutcome::Hang]));
    let first = FlowManager::builder(hanging.clone())
        .config(fast_config())
        .store(store())
        .build()
        .await
        .unwrap();
    let session = first.start_session(Duration::from_secs(30)).await.unwrap();
    first
        .submit_action(&session.id, ActionKind::Navigate, json!({"url": "https://example.com"}))
        .await
        .unwrap();
    first
        .submit_action(&session.id, ActionKind::Click, json!({"selector": "#go"}))
        .await
        .unwrap();
    wait_action(&first, &session.id, "action_1", ActionStatus::Running).await;
    for _ in 0..300 {
        if hanging.call_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    first.shutdown().await;

    let collaborator = Arc::new(ScriptedCollaborator::succeeding());
    let second = FlowManager::builder(collaborator.clone())
        .config(fast_config())
        .store(store())
        .build()
        .await
        .unwrap();
    wait_action(&second, &session.id, "action_1", ActionStatus::Succeeded).await;
    wait_action(&second, &session.id, "action_2", ActionStatus::Succeeded).await;

    let recovered = second.get_status(&session.id).await.unwrap();
    assert_eq!(recovered.action("action_1").unwrap().attempts, 2);
    assert_eq!(recovered.action("action_2").unwrap().attempts, 1);
    assert_eq!(collaborator.call_count().await, 2);
    assert_eq!(hanging.call_count().await, 1);

    let ended = second.end_session(&session.id).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);
}

#[cfg(feature = "async-sqlite")]
#[tokio::test]
async fn test_sqlite_backends_survive_restart_and_replay() {
    use stagehand::config::BackendKind;

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = fast_config();
    cfg.retry.base_delay_ms = 200;
    cfg.retry.max_delay_ms = 200;
    cfg.store.backend = BackendKind::Sqlite;
    cfg.store.path = Some(dir.path().join("sessions.db"));
    cfg.events.backend = BackendKind::Sqlite;
    cfg.events.path = Some(dir.path().join("events.db"));
    cfg.events.poll_interval_ms = 10;
    cfg.queue.backend = BackendKind::Sqlite;
    cfg.queue.path = Some(dir.path().join("retries.db"));
    cfg.queue.poll_interval_ms = 10;

    let flaky = Arc::new(ScriptedCollaborator::succeeding().script(
        ActionKind::Click,
        [ScriptedOutcome::Fail(ActionError::target_unavailable("tab crashed"))],
    ));
    let first = FlowManager::from_config(&cfg, flaky).await.unwrap();
    assert!(first.is_event_log_durable());
    let session = first.start_session(Duration::from_secs(30)).await.unwrap();
    first
        .submit_action(&session.id, ActionKind::Click, json!({"selector": "#buy"}))
        .await
        .unwrap();
    wait_action(&first, &session.id, "action_1", ActionStatus::Retrying).await;
    first.shutdown().await;
    drop(first);

    let second = FlowManager::from_config(&cfg, Arc::new(ScriptedCollaborator::succeeding()))
        .await
        .unwrap();
    wait_action(&second, &session.id, "action_1", ActionStatus::Succeeded).await;

    let mut replay = second
        .subscribe_events_from(EventFilter::Session(session.id.clone()), 0)
        .await
        .unwrap();
    let history = collect_until(&mut replay, EventKind::ActionSucceeded).await;
    assert_eq!(history[0].kind, EventKind::SessionStarted);
    assert!(history.iter().any(|e| e.kind == EventKind::ActionRetrying));
    assert!(replay.cursor().is_some());
    second.shutdown().await;
}
