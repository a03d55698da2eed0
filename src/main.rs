//! Stagehand 脚本执行器
//!
//! 用法：`stagehand <script.json> [config.toml]`
//!
//! 脚本格式：`{"timeout_ms": 60000, "context": {...}, "actions": [{"kind": "navigate", "params": {...}}]}`。
//! 开启一个会话，按顺序提交全部动作，等待它们结束后关闭会话；事件逐行以 JSON 输出到 stdout。
//! 未启用 `browser` feature 时使用脚本化协作方（只回显参数）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::Value;

use stagehand::collaborator::AutomationCollaborator;
use stagehand::config::{load_config, AppConfig};
use stagehand::core::{run_until_shutdown, ShutdownManager};
use stagehand::{ActionKind, EventFilter, EventKind, FlowManager, SessionOptions, SessionStatus};

#[derive(Debug, Deserialize)]
struct Script {
    timeout_ms: Option<u64>,
    #[serde(default)]
    context: Value,
    actions: Vec<ScriptStep>,
}

#[derive(Debug, Deserialize)]
struct ScriptStep {
    kind: ActionKind,
    #[serde(default)]
    params: Value,
}

#[cfg(feature = "browser")]
fn collaborator(cfg: &AppConfig) -> Arc<dyn AutomationCollaborator> {
    Arc::new(
        stagehand::collaborator::ChromeCollaborator::new(cfg.browser.clone())
            .with_action_timeout(cfg.queue.action_timeout()),
    )
}

#[cfg(not(feature = "browser"))]
fn collaborator(_cfg: &AppConfig) -> Arc<dyn AutomationCollaborator> {
    tracing::info!("browser feature disabled, running script in dry-run mode");
    Arc::new(stagehand::collaborator::ScriptedCollaborator::succeeding())
}

/// 执行脚本，返回未成功的动作数
async fn run_script(flow: &FlowManager, script: Script) -> anyhow::Result<usize> {
    let session = flow
        .start_session_with(SessionOptions {
            timeout: script.timeout_ms.map(Duration::from_millis),
            caller: Some("cli".to_string()),
            context: script.context,
        })
        .await
        .context("Failed to start session")?;
    let mut events = flow
        .subscribe_events(EventFilter::Session(session.id.clone()))
        .await
        .context("Failed to subscribe to session events")?;

    let total = script.actions.len();
    for step in script.actions {
        flow.submit_action(&session.id, step.kind, step.params)
            .await
            .context("Failed to submit action")?;
    }

    let mut finished = 0;
    while finished < total {
        let Some(event) = events.recv().await else {
            break;
        };
        println!("{}", serde_json::to_string(&event)?);
        match event.kind {
            EventKind::ActionSucceeded | EventKind::ActionAbandoned | EventKind::ActionCancelled => finished += 1,
            kind if kind.is_session_terminal() => break,
            _ => {}
        }
    }

    let ended = flow.end_session(&session.id).await.context("Failed to end session")?;
    let failed = ended
        .actions
        .iter()
        .filter(|a| a.status != stagehand::ActionStatus::Succeeded)
        .count();
    if ended.status == SessionStatus::TimedOut {
        tracing::warn!(session_id = %ended.id, "Session timed out before the script finished");
    }
    tracing::info!(
        session_id = %ended.id,
        actions = ended.actions.len(),
        failed,
        "Script finished"
    );
    Ok(failed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stagehand::observability::init();

    let mut args = std::env::args().skip(1);
    let Some(script_path) = args.next() else {
        bail!("usage: stagehand <script.json> [config.toml]");
    };
    let cfg = load_config(args.next().map(PathBuf::from)).context("Failed to load config")?;

    let raw = tokio::fs::read_to_string(&script_path)
        .await
        .with_context(|| format!("Failed to read script {}", script_path))?;
    let script: Script = serde_json::from_str(&raw).with_context(|| format!("Invalid script {}", script_path))?;

    let flow = FlowManager::from_config(&cfg, collaborator(&cfg))
        .await
        .context("Failed to create flow manager")?;

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let mut outcome = None;
    run_until_shutdown(
        &shutdown,
        async { outcome = Some(run_script(&flow, script).await) },
        || flow.shutdown(),
        Duration::from_secs(10),
    )
    .await;

    match outcome {
        Some(Ok(0)) => Ok(()),
        Some(Ok(failed)) => bail!("{} actions did not succeed", failed),
        Some(Err(e)) => Err(e),
        None => bail!("Interrupted before the script finished"),
    }
}
