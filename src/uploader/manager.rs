// 上传批次控制器
//
// 负责管理所有活跃批次：
// - 批次准入校验与创建
// - 取消 / 重试失败 / 清理已完成
// - 通过 Notifier 向订阅者推送批次快照
//
// 所有方法都是同步的，不跨 await 持锁；上传本身由调度器驱动

use crate::config::UploadConfig;
use crate::events::{Notifier, Subscription};
use crate::remote::UploadApi;
use crate::uploader::batch::{BatchSnapshot, UploadBatch};
use crate::uploader::scheduler::{ScheduledFile, UploadScheduler};
use crate::uploader::task::{FileInput, UploadPhase};
use crate::uploader::validation::{validate_batch, ValidationError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 控制器操作错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("批次不存在: {0}")]
    BatchNotFound(String),
    #[error("文件不存在: batch={batch_id}, file={file_id}")]
    FileNotFound { batch_id: String, file_id: String },
}

struct ControllerInner {
    config: Arc<UploadConfig>,
    batches: DashMap<String, Arc<UploadBatch>>,
    next_seq: AtomicU64,
    scheduler: UploadScheduler,
    notifier: Notifier,
}

impl ControllerInner {
    /// 按创建顺序排列的批次
    fn ordered_batches(&self) -> Vec<Arc<UploadBatch>> {
        let mut batches: Vec<Arc<UploadBatch>> =
            self.batches.iter().map(|e| e.value().clone()).collect();
        batches.sort_by_key(|b| b.seq);
        batches
    }

    fn snapshots(&self) -> Vec<BatchSnapshot> {
        self.ordered_batches()
            .iter()
            .map(|b| b.snapshot())
            .collect()
    }

    fn batch(&self, batch_id: &str) -> Result<Arc<UploadBatch>, ControllerError> {
        self.batches
            .get(batch_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ControllerError::BatchNotFound(batch_id.to_string()))
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.notifier.shutdown();
    }
}

/// 上传批次控制器
///
/// 内部持有 Arc，clone 开销很小
#[derive(Clone)]
pub struct BatchController {
    inner: Arc<ControllerInner>,
}

impl BatchController {
    /// 创建控制器，启动调度循环和推送任务
    pub fn new(api: Arc<dyn UploadApi>, config: UploadConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let notifier = Notifier::new(Duration::from_millis(config.notify_interval_ms));
        let scheduler = UploadScheduler::new(api, config.clone(), notifier.clone());

        let inner = Arc::new(ControllerInner {
            config,
            batches: DashMap::new(),
            next_seq: AtomicU64::new(1),
            scheduler,
            notifier,
        });

        let weak: Weak<ControllerInner> = Arc::downgrade(&inner);
        inner
            .notifier
            .start(move || weak.upgrade().map(|inner| inner.snapshots()));

        info!(
            "上传控制器已创建: 最大并发={}, 分片大小={} bytes, 最大尝试次数={}",
            inner.config.max_concurrent_uploads,
            inner.config.chunk_size,
            inner.config.max_retry_attempts
        );

        Ok(Self { inner })
    }

    /// 创建批次
    ///
    /// 整批校验，任一文件不合格都拒绝整个提交；成功后所有文件进入排队状态
    pub fn create_batch(
        &self,
        files: Vec<FileInput>,
        destination: impl Into<String>,
    ) -> Result<String, ValidationError> {
        if let Err(e) = validate_batch(&files, &self.inner.config) {
            warn!("批次被拒绝: {}", e);
            return Err(e);
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let batch = Arc::new(UploadBatch::new(seq, destination.into(), files));
        let batch_id = batch.id.clone();

        info!(
            "创建批次: id={}, 文件数={}, 总大小={} bytes, 目标={}",
            batch_id,
            batch.files.len(),
            batch.total_bytes(),
            batch.destination
        );

        self.inner.batches.insert(batch_id.clone(), batch.clone());
        for (index, file) in batch.files.iter().enumerate() {
            self.inner.scheduler.enqueue(ScheduledFile {
                batch_id: batch_id.clone(),
                batch_seq: batch.seq,
                file_index: index,
                destination: batch.destination.clone(),
                file: file.clone(),
            });
        }
        debug!(
            "批次已入队: id={}, 全局排队文件数={}, 运行中={}",
            batch_id,
            self.inner.scheduler.queued_count(),
            self.inner.scheduler.active_count()
        );
        self.inner.notifier.mark_dirty();

        Ok(batch_id)
    }

    /// 订阅批次快照
    pub fn subscribe(&self) -> Subscription {
        let subscription = self.inner.notifier.subscribe();
        self.inner.notifier.mark_dirty();
        subscription
    }

    /// 取消整个批次，返回被取消的文件数
    ///
    /// 进行中的网络操作会被中止，之后到达的响应全部丢弃
    pub fn cancel_batch(&self, batch_id: &str) -> Result<usize, ControllerError> {
        let batch = self.inner.batch(batch_id)?;
        batch.cancel_token.cancel();
        self.inner.scheduler.remove_batch(batch_id);

        let cancelled = batch
            .files
            .iter()
            .filter(|f| f.lock().mark_cancelled())
            .count();

        info!("取消批次: id={}, 取消文件数={}", batch_id, cancelled);
        self.inner.notifier.mark_dirty();
        Ok(cancelled)
    }

    /// 取消单个文件，文件已处于终态时返回 false
    pub fn cancel_file(&self, batch_id: &str, file_id: &str) -> Result<bool, ControllerError> {
        let batch = self.inner.batch(batch_id)?;
        let file = batch
            .file(file_id)
            .ok_or_else(|| ControllerError::FileNotFound {
                batch_id: batch_id.to_string(),
                file_id: file_id.to_string(),
            })?;

        let (cancelled, index) = {
            let mut f = file.lock();
            (f.mark_cancelled(), f.index)
        };
        if cancelled {
            self.inner.scheduler.remove_file(batch_id, index);
            info!("取消文件: batch={}, file={}", batch_id, file_id);
            self.inner.notifier.mark_dirty();
        }
        Ok(cancelled)
    }

    /// 重新排队批次中失败且未达最大尝试次数的文件，返回重新排队的数量
    ///
    /// 已确认的分片保留；会话失效时任务会从 INIT 重新开始
    pub fn retry_failed(&self, batch_id: &str) -> Result<usize, ControllerError> {
        let batch = self.inner.batch(batch_id)?;
        if batch.cancel_token.is_cancelled() {
            return Ok(0);
        }

        let max_attempts = self.inner.config.max_retry_attempts;
        let mut retried = 0;
        for (index, file) in batch.files.iter().enumerate() {
            let eligible = {
                let mut f = file.lock();
                let eligible = f.phase == UploadPhase::Failed
                    && f.attempts < max_attempts
                    && !f.cancel_token.is_cancelled();
                if eligible {
                    f.requeue();
                }
                eligible
            };
            if eligible {
                self.inner.scheduler.enqueue(ScheduledFile {
                    batch_id: batch.id.clone(),
                    batch_seq: batch.seq,
                    file_index: index,
                    destination: batch.destination.clone(),
                    file: file.clone(),
                });
                retried += 1;
            }
        }

        if retried > 0 {
            info!("重试批次失败文件: id={}, 数量={}", batch_id, retried);
            self.inner.notifier.mark_dirty();
        }
        Ok(retried)
    }

    /// 移除所有文件都已进入终态的批次，返回被移除的批次 ID
    pub fn clear_completed(&self) -> Vec<String> {
        let removed: Vec<String> = self
            .inner
            .ordered_batches()
            .into_iter()
            .filter(|b| b.is_finished())
            .map(|b| b.id.clone())
            .collect();

        for id in &removed {
            self.inner.batches.remove(id);
            self.inner.scheduler.remove_batch(id);
        }

        if !removed.is_empty() {
            info!("清理已完成批次: {} 个", removed.len());
            self.inner.notifier.mark_dirty();
        }
        removed
    }

    /// 所有批次的当前快照（按创建顺序）
    pub fn batches(&self) -> Vec<BatchSnapshot> {
        self.inner.snapshots()
    }

    pub fn get_batch(&self, batch_id: &str) -> Option<BatchSnapshot> {
        self.inner.batch(batch_id).ok().map(|b| b.snapshot())
    }

    /// 动态调整全局最大并发上传数
    pub fn update_max_concurrent_uploads(&self, new_max: usize) {
        self.inner.scheduler.update_max_concurrent(new_max);
    }

    /// 正在运行的文件数
    pub fn active_uploads(&self) -> usize {
        self.inner.scheduler.active_count()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    /// 取消所有批次并停止后台任务
    pub fn shutdown(&self) {
        for batch in self.inner.ordered_batches() {
            if !batch.is_finished() {
                let _ = self.cancel_batch(&batch.id);
            }
        }
        self.inner.scheduler.shutdown();
        self.inner.notifier.publish(self.inner.snapshots());
        self.inner.notifier.shutdown();
        info!("上传控制器已关闭");
    }
}
