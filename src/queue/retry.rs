//! 重试策略：指数退避 + 抖动
//!
//! `delay = base_delay × multiplier^(attempt-1)`，封顶 `max_delay`，再加上 `[0, jitter × delay]`
//! 的均匀抖动。

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{ActionErrorKind, TransportError};

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retryable() -> Vec<ActionErrorKind> {
    vec![
        ActionErrorKind::Timeout,
        ActionErrorKind::TargetUnavailable,
        ActionErrorKind::Unknown,
    ]
}

fn default_jitter() -> f64 {
    0.1
}

/// 重试策略配置（对应配置文件 `[retry]`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base_delay_ms", alias = "base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms", alias = "max_delay")]
    pub max_delay_ms: u64,
    /// 总执行次数上限（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retryable")]
    pub retryable_error_kinds: Vec<ActionErrorKind>,
    /// 抖动比例，0 表示不抖动
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            retryable_error_kinds: default_retryable(),
            jitter: default_jitter(),
        }
    }
}

/// 放弃原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    AttemptsExhausted,
    NonRetryable,
    /// 会话正在结束，不再安排重试
    SessionClosing,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::NonRetryable => "non_retryable",
            Self::SessionClosing => "session_closing",
        }
    }
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次失败后的裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Abandon { reason: AbandonReason },
}

impl RetryPolicy {
    /// 不带抖动的退避时长；attempt 从 1 开始
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// 在 backoff 之上叠加 `[0, jitter × delay]` 的抖动
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(extra)
    }

    pub fn is_retryable(&self, kind: ActionErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }

    /// 第 `attempts` 次执行以 `kind` 失败后的裁决
    pub fn decide(&self, attempts: u32, kind: ActionErrorKind) -> RetryDecision {
        if !self.is_retryable(kind) {
            return RetryDecision::Abandon {
                reason: AbandonReason::NonRetryable,
            };
        }
        if attempts >= self.max_attempts {
            return RetryDecision::Abandon {
                reason: AbandonReason::AttemptsExhausted,
            };
        }
        RetryDecision::Retry {
            delay: self.jittered(self.backoff(attempts)),
        }
    }
}

/// 对后端操作做有界重试（存储写入、事件投递），全部失败返回最后一次错误
pub async fn retry_transport<T, F, Fut>(
    what: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = base_delay.saturating_mul(1 << (attempt - 1).min(10));
                tracing::warn!(
                    attempt,
                    max_attempts,
                    "{} failed: {}, retrying in {}ms",
                    what,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
