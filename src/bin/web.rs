//! Stagehand HTTP 服务
//!
//! 启动: cargo run --bin stagehand-web --features web
//! 监听地址取 `[web].bind_addr`，可用 STAGEHAND__WEB__BIND_ADDR 覆盖

#![cfg(feature = "web")]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use stagehand::collaborator::AutomationCollaborator;
use stagehand::config::{load_config, AppConfig};
use stagehand::core::{run_until_shutdown, ShutdownManager};
use stagehand::FlowManager;

#[cfg(feature = "browser")]
fn collaborator(cfg: &AppConfig) -> Arc<dyn AutomationCollaborator> {
    Arc::new(
        stagehand::collaborator::ChromeCollaborator::new(cfg.browser.clone())
            .with_action_timeout(cfg.queue.action_timeout()),
    )
}

#[cfg(not(feature = "browser"))]
fn collaborator(_cfg: &AppConfig) -> Arc<dyn AutomationCollaborator> {
    tracing::warn!("browser feature disabled, actions are executed by the scripted collaborator");
    Arc::new(stagehand::collaborator::ScriptedCollaborator::succeeding())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stagehand::observability::init();

    let cfg = load_config(std::env::args().nth(1).map(Into::into)).context("Failed to load config")?;
    let flow = FlowManager::from_config(&cfg, collaborator(&cfg))
        .await
        .context("Failed to create flow manager")?;

    let listener = tokio::net::TcpListener::bind(&cfg.web.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.web.bind_addr))?;
    tracing::info!("Stagehand API: http://{}", cfg.web.bind_addr);

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let token = shutdown.token();
    let app = stagehand::web::router(flow.clone());
    run_until_shutdown(
        &shutdown,
        async {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                tracing::error!("Server error: {}", e);
            }
        },
        || flow.shutdown(),
        Duration::from_secs(15),
    )
    .await;

    tracing::info!("Stagehand API stopped");
    Ok(())
}
