//! Headless Chrome 协作方
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。每个会话独占一个标签页，
//! 会话结束时关闭。headless_chrome 是同步 API，所有调用都放到 spawn_blocking 中执行。
//!
//! 阻塞任务无法被取消：超时或中止后原调用仍可能在跑。标签页上的操作因此持有该页的互斥锁，
//! 后续动作排在它后面；驱动自身的等待上限设为动作超时，保证锁最终会释放。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::browser::tab::ModifierKey;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::{json, Value};

use super::{str_param, ActionContext, AutomationCollaborator};
use crate::config::{BrowserSection, QueueSection};
use crate::core::{ActionError, ActionErrorKind};
use crate::session::ActionKind;

/// 从 URL 提取域名（小写）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let url = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let host = url.split('/').next()?;
    let host = host.split(':').next()?;
    Some(host.to_lowercase())
}

/// 把驱动错误归类到重试策略使用的错误类型
fn classify(context: &str, err: impl std::fmt::Display) -> ActionError {
    let message = format!("{}: {}", context, err);
    let lower = message.to_lowercase();
    let kind = if lower.contains("timeout") || lower.contains("timed out") {
        ActionErrorKind::Timeout
    } else if lower.contains("no element") || lower.contains("not found") || lower.contains("invalid") {
        ActionErrorKind::InvalidState
    } else if lower.contains("connection") || lower.contains("closed") || lower.contains("launch") {
        ActionErrorKind::TargetUnavailable
    } else {
        ActionErrorKind::Unknown
    };
    ActionError::new(kind, message)
}

fn js_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

/// 持有 busy 锁期间独占标签页
fn exclusive<T>(busy: &Mutex<()>, f: impl FnOnce() -> Result<T, ActionError>) -> Result<T, ActionError> {
    let _guard = busy
        .lock()
        .map_err(|e| ActionError::unknown(format!("Tab lock poisoned: {}", e)))?;
    f()
}

struct TabSlot {
    tab: Arc<Tab>,
    busy: Mutex<()>,
}

pub struct ChromeCollaborator {
    options: BrowserSection,
    action_timeout: Duration,
    allowed_domains: HashSet<String>,
    browser: Arc<Mutex<Option<Browser>>>,
    tabs: Arc<Mutex<HashMap<String, Arc<TabSlot>>>>,
}

impl ChromeCollaborator {
    pub fn new(options: BrowserSection) -> Self {
        let allowed_domains = options
            .allowed_domains
            .iter()
            .map(|d| d.to_lowercase())
            .collect();
        Self {
            options,
            action_timeout: QueueSection::default().action_timeout(),
            allowed_domains,
            browser: Arc::new(Mutex::new(None)),
            tabs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 驱动等待元素、页面加载的上限，应与 `[queue].action_timeout_ms` 一致
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    fn check_allowed(&self, url: &str) -> Result<(), ActionError> {
        if self.allowed_domains.is_empty() {
            return Ok(());
        }
        let domain = extract_domain(url)
            .ok_or_else(|| ActionError::invalid_state(format!("Invalid or missing URL: {}", url)))?;
        if self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(ActionError::invalid_state(format!("Domain not in allowlist: {}", domain)))
        }
    }

    /// 取会话的标签页，不存在时新开（必要时先启动浏览器）
    fn tab_for(
        options: &BrowserSection,
        action_timeout: Duration,
        browser: &Mutex<Option<Browser>>,
        tabs: &Mutex<HashMap<String, Arc<TabSlot>>>,
        session_id: &str,
    ) -> Result<Arc<TabSlot>, ActionError> {
        let mut tabs = tabs
            .lock()
            .map_err(|e| ActionError::unknown(format!("Tab registry poisoned: {}", e)))?;
        if let Some(tab) = tabs.get(session_id) {
            return Ok(Arc::clone(tab));
        }

        let mut browser_guard = browser
            .lock()
            .map_err(|e| ActionError::unknown(format!("Browser handle poisoned: {}", e)))?;
        if browser_guard.is_none() {
            let launch = LaunchOptions::default_builder()
                .headless(options.headless)
                .window_size(Some((options.window_width, options.window_height)))
                .path(options.chrome_path.clone())
                .build()
                .map_err(|e| ActionError::target_unavailable(format!("Invalid launch options: {}", e)))?;
            let launched = Browser::new(launch).map_err(|e| classify("Chrome launch failed", e))?;
            tracing::info!(headless = options.headless, "Chrome launched");
            *browser_guard = Some(launched);
        }
        let Some(running) = browser_guard.as_ref() else {
            return Err(ActionError::target_unavailable("Browser not running"));
        };

        let tab = running.new_tab().map_err(|e| classify("Browser tab failed", e))?;
        tab.set_default_timeout(action_timeout);
        let slot = Arc::new(TabSlot {
            tab,
            busy: Mutex::new(()),
        });
        tabs.insert(session_id.to_string(), Arc::clone(&slot));
        Ok(slot)
    }

    fn run(
        tab: &Arc<Tab>,
        kind: ActionKind,
        params: &Value,
        settle: Duration,
        limit: Duration,
    ) -> Result<Value, ActionError> {
        match kind {
            ActionKind::Navigate => {
                let url = str_param(params, "url")?;
                tab.navigate_to(url).map_err(|e| classify("Navigate failed", e))?;
                tab.wait_until_navigated().map_err(|e| classify("Page load failed", e))?;
                std::thread::sleep(settle);
                let title = tab.get_title().unwrap_or_default();
                Ok(json!({ "url": tab.get_url(), "title": title }))
            }
            ActionKind::Click => {
                let selector = str_param(params, "selector")?;
                tab.wait_for_element(selector)
                    .map_err(|e| classify("Element not found", e))?
                    .click()
                    .map_err(|e| classify("Click failed", e))?;
                Ok(json!({ "clicked": selector }))
            }
            ActionKind::RightClick => {
                let selector = str_param(params, "selector")?;
                tab.wait_for_element(selector)
                    .map_err(|e| classify("Element not found", e))?;
                let js = format!(
                    "document.querySelector({}).dispatchEvent(new MouseEvent('contextmenu', {{ bubbles: true, button: 2 }}))",
                    js_string(selector)
                );
                tab.evaluate(&js, false).map_err(|e| classify("Right click failed", e))?;
                Ok(json!({ "right_clicked": selector }))
            }
            ActionKind::Hover => {
                let selector = str_param(params, "selector")?;
                tab.wait_for_element(selector)
                    .map_err(|e| classify("Element not found", e))?
                    .move_mouse_over()
                    .map_err(|e| classify("Hover failed", e))?;
                Ok(json!({ "hovered": selector }))
            }
            ActionKind::Type => {
                let selector = str_param(params, "selector")?;
                let text = params.get("text").and_then(|v| v.as_str()).unwrap_or("");
                tab.wait_for_element(selector)
                    .map_err(|e| classify("Element not found", e))?
                    .type_into(text)
                    .map_err(|e| classify("Type failed", e))?;
                Ok(json!({ "typed": text.chars().count() }))
            }
            ActionKind::Scroll => {
                let amount = params.get("amount").and_then(|v| v.as_i64()).unwrap_or(500);
                let direction = params.get("direction").and_then(|v| v.as_str()).unwrap_or("down");
                let delta = if direction == "up" { -amount } else { amount };
                tab.evaluate(&format!("window.scrollBy(0, {})", delta), false)
                    .map_err(|e| classify("Scroll failed", e))?;
                Ok(json!({ "scrolled": delta }))
            }
            ActionKind::Wait => {
                let ms = params.get("ms").and_then(|v| v.as_u64()).unwrap_or(1000);
                std::thread::sleep(Duration::from_millis(ms).min(limit));
                Ok(json!({ "waited_ms": ms }))
            }
            ActionKind::GoBack => {
                tab.evaluate("history.back()", false)
                    .map_err(|e| classify("Go back failed", e))?;
                std::thread::sleep(settle);
                Ok(json!({ "url": tab.get_url() }))
            }
            ActionKind::Refresh => {
                tab.reload(false, None).map_err(|e| classify("Refresh failed", e))?;
                tab.wait_until_navigated().map_err(|e| classify("Page load failed", e))?;
                Ok(json!({ "url": tab.get_url() }))
            }
            ActionKind::KeyboardShortcut => {
                let key = str_param(params, "key")?;
                let modifiers: Vec<ModifierKey> = params
                    .get("modifiers")
                    .and_then(|v| v.as_array())
                    .map(|list| {
                        list.iter()
                            .filter_map(|m| match m.as_str()? {
                                "ctrl" | "control" => Some(ModifierKey::Ctrl),
                                "shift" => Some(ModifierKey::Shift),
                                "alt" => Some(ModifierKey::Alt),
                                "meta" | "cmd" => Some(ModifierKey::Meta),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let modifiers = (!modifiers.is_empty()).then_some(modifiers.as_slice());
                tab.press_key_with_modifiers(key, modifiers)
                    .map_err(|e| classify("Key press failed", e))?;
                Ok(json!({ "pressed": key }))
            }
            ActionKind::Zoom => {
                let level = params.get("level").and_then(|v| v.as_f64()).unwrap_or(1.0);
                tab.evaluate(&format!("document.body.style.zoom = '{}'", level), false)
                    .map_err(|e| classify("Zoom failed", e))?;
                Ok(json!({ "zoom": level }))
            }
            ActionKind::Screenshot => {
                let png = tab
                    .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                    .map_err(|e| classify("Screenshot failed", e))?;
                let saved = match params.get("path").and_then(|v| v.as_str()) {
                    Some(path) => {
                        std::fs::write(path, &png)
                            .map_err(|e| ActionError::unknown(format!("Write screenshot failed: {}", e)))?;
                        Some(path.to_string())
                    }
                    None => None,
                };
                Ok(json!({ "bytes": png.len(), "path": saved }))
            }
        }
    }
}

#[async_trait]
impl AutomationCollaborator for ChromeCollaborator {
    async fn execute(&self, kind: ActionKind, params: &Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        if kind == ActionKind::Navigate {
            self.check_allowed(str_param(params, "url")?)?;
        }

        tracing::info!(
            session_id = %ctx.session_id,
            action_id = %ctx.action_id,
            kind = %kind,
            attempt = ctx.attempt,
            "browser execute"
        );

        let options = self.options.clone();
        let limit = self.action_timeout;
        let browser = Arc::clone(&self.browser);
        let tabs = Arc::clone(&self.tabs);
        let session_id = ctx.session_id.clone();
        let params = params.clone();

        tokio::task::spawn_blocking(move || {
            let slot = Self::tab_for(&options, limit, &browser, &tabs, &session_id)?;
            exclusive(&slot.busy, || {
                Self::run(&slot.tab, kind, &params, Duration::from_millis(options.settle_ms), limit)
            })
        })
        .await
        .map_err(|e| ActionError::unknown(format!("Task join: {}", e)))?
    }

    async fn release(&self, session_id: &str) {
        let tab = match self.tabs.lock() {
            Ok(mut tabs) => tabs.remove(session_id),
            Err(e) => {
                tracing::warn!("Tab registry poisoned: {}", e);
                None
            }
        };
        if let Some(slot) = tab {
            let session_id = session_id.to_string();
            // 等仍在运行的阻塞调用结束后再关闭
            let closed = tokio::task::spawn_blocking(move || {
                exclusive(&slot.busy, || {
                    slot.tab
                        .close(false)
                        .map_err(|e| classify("Closing tab failed", e))
                })
            })
            .await;
            if let Ok(Err(e)) = closed {
                tracing::warn!(session_id = %session_id, "{}", e);
            }
        }
    }
}
