//! 单会话滚动窗口限流：窗口内最多 `max` 次动作启动
//!
//! 超限时只推迟出队，从不丢弃动作。

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RollingWindow {
    /// 0 表示不限流
    max: u32,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl RollingWindow {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            starts: VecDeque::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.starts.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    /// 允许启动返回 Ok，否则返回还需等待的时长
    pub fn check(&mut self, now: Instant) -> Result<(), Duration> {
        if self.max == 0 {
            return Ok(());
        }
        self.evict(now);
        if (self.starts.len() as u32) < self.max {
            return Ok(());
        }
        let oldest = self.starts.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// 记录一次启动
    pub fn record(&mut self, now: Instant) {
        if self.max == 0 {
            return;
        }
        self.starts.push_back(now);
    }
}
