// 重试退避策略
//
// 延迟序列按 2 的幂增长并截断到上限，实际等待时间在 [delay/2, delay] 内随机抖动

use crate::config::UploadConfig;
use crate::remote::RemoteErrorKind;
use rand::Rng;
use std::time::Duration;

/// 退避参数
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_part_ms: u64,
    pub base_file_ms: u64,
    pub max_ms: u64,
    pub rate_limit_ms: u64,
}

impl From<&UploadConfig> for BackoffPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            base_part_ms: config.base_part_backoff_ms,
            base_file_ms: config.base_file_backoff_ms,
            max_ms: config.max_backoff_ms,
            rate_limit_ms: config.rate_limit_backoff_ms,
        }
    }
}

impl BackoffPolicy {
    /// 分片级退避上限（抖动前）
    ///
    /// # 延迟序列（base=200ms）
    /// - retry=0: 200ms
    /// - retry=1: 400ms
    /// - retry=2: 800ms
    /// - 最大: max_ms；限流时不少于 rate_limit_ms
    pub fn part_delay_ms(&self, retry: u32, kind: RemoteErrorKind) -> u64 {
        let delay = exponential(self.base_part_ms, retry, self.max_ms);
        if kind == RemoteErrorKind::RateLimited {
            delay.max(self.rate_limit_ms)
        } else {
            delay
        }
    }

    /// 文件级退避上限（抖动前），`attempts` 为已失败次数（从 1 开始）
    pub fn file_delay_ms(&self, attempts: u32) -> u64 {
        exponential(self.base_file_ms, attempts.saturating_sub(1), self.max_ms)
    }

    pub fn part_delay(&self, retry: u32, kind: RemoteErrorKind) -> Duration {
        jittered(self.part_delay_ms(retry, kind))
    }

    pub fn file_delay(&self, attempts: u32) -> Duration {
        jittered(self.file_delay_ms(attempts))
    }
}

fn exponential(base_ms: u64, exponent: u32, max_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(exponent.min(63)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

/// 在 [delay/2, delay] 内均匀抖动
pub fn jittered(delay_ms: u64) -> Duration {
    if delay_ms == 0 {
        return Duration::ZERO;
    }
    let low = delay_ms / 2;
    Duration::from_millis(rand::thread_rng().gen_range(low..=delay_ms))
}
