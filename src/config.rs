//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STAGEHAND__*` 覆盖（双下划线表示嵌套，如
//! `STAGEHAND__QUEUE__RATE_LIMIT_MAX=5`）。所有字段都有默认值，空配置即可运行。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::queue::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionSection,
    pub queue: QueueSection,
    pub retry: RetryPolicy,
    pub store: StoreSection,
    pub events: EventsSection,
    pub browser: BrowserSection,
    pub web: WebSection,
}

/// 后端选择：进程内或 SQLite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

/// 结束会话时对未完成动作的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndPolicy {
    /// 立即取消排队中的动作
    #[default]
    Cancel,
    /// 等待队列排空（最长 drain_timeout），超时后退化为 cancel
    Drain,
}

/// [session] 段：会话超时、容量与结束策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// start_session 未指定超时时使用
    pub default_timeout_ms: u64,
    /// 超时后进入 idle 的宽限期；0 表示直接 timed_out
    pub idle_grace_ms: u64,
    /// 同时存活的会话数上限，None 为不限
    pub max_sessions: Option<usize>,
    pub max_sessions_per_caller: Option<usize>,
    pub end_policy: EndPolicy,
    pub drain_timeout_ms: u64,
    /// 结束时给执行中动作的完成时间，超出后强制中止
    pub in_flight_grace_ms: u64,
    pub watchdog_interval_ms: u64,
    /// 终态会话在内存中保留的时长
    pub terminal_retention_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            idle_grace_ms: 0,
            max_sessions: None,
            max_sessions_per_caller: None,
            end_policy: EndPolicy::Cancel,
            drain_timeout_ms: 10_000,
            in_flight_grace_ms: 2_000,
            watchdog_interval_ms: 1_000,
            terminal_retention_ms: 60_000,
        }
    }
}

impl SessionSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn in_flight_grace(&self) -> Duration {
        Duration::from_millis(self.in_flight_grace_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_millis(self.terminal_retention_ms)
    }
}

/// [queue] 段：限流、动作超时与重试延迟队列后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// 每个窗口内最多启动的动作数；0 为不限
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    /// 单次协作方调用超时
    pub action_timeout_ms: u64,
    pub backend: BackendKind,
    pub path: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            rate_limit_max: 0,
            rate_limit_window_ms: 1_000,
            action_timeout_ms: 30_000,
            backend: BackendKind::Memory,
            path: None,
            poll_interval_ms: 200,
        }
    }
}

impl QueueSection {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// [store] 段：会话存储后端与 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: BackendKind,
    pub path: Option<PathBuf>,
    /// 存活会话记录的 TTL
    pub retention_secs: u64,
    /// ended / timed_out 会话记录的 TTL
    pub terminal_retention_secs: u64,
    /// 单次保存失败后的重试上限
    pub save_max_attempts: u32,
    pub save_base_delay_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: None,
            retention_secs: 86_400,
            terminal_retention_secs: 3_600,
            save_max_attempts: 3,
            save_base_delay_ms: 50,
        }
    }
}

impl StoreSection {
    pub fn save_base_delay(&self) -> Duration {
        Duration::from_millis(self.save_base_delay_ms)
    }
}

/// [events] 段：事件传输后端与投递重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub backend: BackendKind,
    pub path: Option<PathBuf>,
    /// 进程内订阅者积压告警阈值
    pub channel_capacity: usize,
    /// 持久化发件箱容量，满时发布方等待
    pub outbox_capacity: usize,
    pub publish_max_attempts: u32,
    pub publish_base_delay_ms: u64,
    /// 持久化日志的订阅轮询间隔
    pub poll_interval_ms: u64,
    /// 持久化日志保留时长；0 表示不清理
    pub log_retention_secs: u64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: None,
            channel_capacity: 1024,
            outbox_capacity: 256,
            publish_max_attempts: 3,
            publish_base_delay_ms: 100,
            poll_interval_ms: 100,
            log_retention_secs: 604800,
        }
    }
}

impl EventsSection {
    pub fn publish_base_delay(&self) -> Duration {
        Duration::from_millis(self.publish_base_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn log_retention(&self) -> Option<Duration> {
        (self.log_retention_secs > 0).then(|| Duration::from_secs(self.log_retention_secs))
    }
}

/// [browser] 段：Headless Chrome 启动参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    /// 导航后等待页面稳定的时间
    pub settle_ms: u64,
    /// 允许导航的域名；为空时不限制
    pub allowed_domains: Vec<String>,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            window_width: 1280,
            window_height: 800,
            settle_ms: 500,
            allowed_domains: Vec::new(),
        }
    }
}

/// [web] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub bind_addr: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 STAGEHAND__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在）
/// 3. 最后叠加环境变量 STAGEHAND__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STAGEHAND")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
