//! 推送节流器
//!
//! 控制快照的发布频率，避免进度更新形成事件风暴

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 推送节流器
///
/// 记录上次发布的时刻（相对于创建时刻的纳秒数），间隔为 0 时不节流
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次发布的时间戳，0 表示尚未发布
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 距离下一次允许发布还需等待多久，None 表示现在即可发布
    pub fn remaining(&self) -> Option<Duration> {
        let last = self.last_emit_nanos.load(Ordering::Acquire);
        if last == 0 || self.interval_nanos == 0 {
            return None;
        }
        let elapsed = self.now_nanos().saturating_sub(last);
        (elapsed < self.interval_nanos)
            .then(|| Duration::from_nanos(self.interval_nanos - elapsed))
    }

    /// 记录一次发布
    pub fn force_emit(&self) {
        self.last_emit_nanos.store(self.now_nanos(), Ordering::Release);
    }

    // 最小为 1，保证 0 只表示"尚未发布"
    fn now_nanos(&self) -> u64 {
        (self.origin.elapsed().as_nanos() as u64).max(1)
    }
}
