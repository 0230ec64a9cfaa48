// 批次进度聚合
//
// 速度为累计平均值：已确认字节 / (最近一次进展时刻 - 首次准入时刻)
// 两次进展之间速度保持不变，只有已确认字节增长时才重新计算

use std::time::{Duration, Instant};

/// 某一时刻的批次进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressStats {
    /// 已确认字节数
    pub uploaded_bytes: u64,
    /// 平均速度 (bytes/s)
    pub average_speed: u64,
    /// 预计剩余秒数，None 表示已完成或无法估算
    pub eta_secs: Option<u64>,
}

/// 单个文件的进度采样
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProgress {
    /// 已确认字节的高水位
    pub confirmed_bytes: u64,
    pub admitted_at: Option<Instant>,
    pub progressed_at: Option<Instant>,
}

/// 批次进度聚合器
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    total_bytes: u64,
}

impl ProgressAggregator {
    pub fn new(total_bytes: u64) -> Self {
        Self { total_bytes }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// 由各文件的采样汇总出批次进度
    ///
    /// 计时从最早的准入开始，到最近一次已确认字节增长为止
    pub fn measure(&self, files: impl IntoIterator<Item = FileProgress>) -> ProgressStats {
        let mut uploaded = 0u64;
        let mut first_admitted: Option<Instant> = None;
        let mut last_progress: Option<Instant> = None;
        for file in files {
            uploaded = uploaded.saturating_add(file.confirmed_bytes);
            first_admitted = earliest(first_admitted, file.admitted_at);
            last_progress = last_progress.max(file.progressed_at);
        }

        let elapsed = match (first_admitted, last_progress) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        };
        self.stats_at(uploaded.min(self.total_bytes), elapsed)
    }

    fn stats_at(&self, uploaded_bytes: u64, elapsed: Duration) -> ProgressStats {
        let average_speed = average_speed(uploaded_bytes, elapsed);
        ProgressStats {
            uploaded_bytes,
            average_speed,
            eta_secs: eta(self.total_bytes, uploaded_bytes, average_speed),
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// 累计平均速度 (bytes/s)
pub fn average_speed(uploaded_bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (uploaded_bytes as f64 / secs) as u64
}

/// 估算剩余时间 (秒)
pub fn eta(total_bytes: u64, uploaded_bytes: u64, speed: u64) -> Option<u64> {
    if uploaded_bytes >= total_bytes || speed == 0 {
        return None;
    }
    Some((total_bytes - uploaded_bytes) / speed)
}
