// 全局上传调度器
//
// 功能：
// - 按批次创建顺序 Round-Robin 公平调度，批次内按文件顺序
// - 全局并发控制：一个文件从 INIT 到登记结束始终占用一个槽位
// - 槽位用 CAS 获取、由守卫在 Drop 时归还，任何完成/失败/取消都会立即触发下一轮调度
// - 自动重试的文件在退避结束后重新入队（期间被取消则放弃）

use crate::config::UploadConfig;
use crate::events::Notifier;
use crate::remote::UploadApi;
use crate::uploader::batch::SharedFile;
use crate::uploader::engine::{ChunkedUploadTask, TaskOutcome};
use crate::uploader::task::{FileError, UploadPhase};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 一个待调度的文件
#[derive(Debug, Clone)]
pub struct ScheduledFile {
    pub batch_id: String,
    /// 批次创建顺序号
    pub batch_seq: u64,
    /// 在批次中的位置
    pub file_index: usize,
    pub destination: String,
    pub file: SharedFile,
}

#[derive(Debug)]
struct BatchQueue {
    batch_id: String,
    seq: u64,
    files: VecDeque<ScheduledFile>,
}

/// 各批次的排队队列
///
/// 队列按批次顺序号排列，队列内按文件位置排列
#[derive(Debug, Default)]
struct ReadyQueues {
    queues: Vec<BatchQueue>,
    /// 上一次出队的批次顺序号
    last_served: Option<u64>,
}

impl ReadyQueues {
    /// 入队；同一文件重复入队时忽略
    fn push(&mut self, job: ScheduledFile) -> bool {
        let pos = match self.queues.binary_search_by_key(&job.batch_seq, |q| q.seq) {
            Ok(pos) => pos,
            Err(pos) => {
                self.queues.insert(
                    pos,
                    BatchQueue {
                        batch_id: job.batch_id.clone(),
                        seq: job.batch_seq,
                        files: VecDeque::new(),
                    },
                );
                pos
            }
        };

        let files = &mut self.queues[pos].files;
        match files.binary_search_by_key(&job.file_index, |f| f.file_index) {
            Ok(_) => false,
            Err(idx) => {
                files.insert(idx, job);
                true
            }
        }
    }

    /// 轮转到下一个非空批次，取出其第一个文件
    fn pop_next(&mut self) -> Option<ScheduledFile> {
        self.queues.retain(|q| !q.files.is_empty());
        if self.queues.is_empty() {
            return None;
        }

        let idx = match self.last_served {
            Some(last) => self
                .queues
                .iter()
                .position(|q| q.seq > last)
                .unwrap_or(0),
            None => 0,
        };

        let queue = &mut self.queues[idx];
        self.last_served = Some(queue.seq);
        queue.files.pop_front()
    }

    fn remove_batch(&mut self, batch_id: &str) -> usize {
        let mut removed = 0;
        self.queues.retain(|q| {
            if q.batch_id == batch_id {
                removed += q.files.len();
                false
            } else {
                true
            }
        });
        removed
    }

    fn remove_file(&mut self, batch_id: &str, file_index: usize) -> bool {
        for queue in self.queues.iter_mut().filter(|q| q.batch_id == batch_id) {
            if let Some(pos) = queue.files.iter().position(|f| f.file_index == file_index) {
                queue.files.remove(pos);
                return true;
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.queues.iter().map(|q| q.files.len()).sum()
    }
}

struct SchedulerInner {
    api: Arc<dyn UploadApi>,
    config: Arc<UploadConfig>,
    notifier: Notifier,
    queues: Mutex<ReadyQueues>,
    /// 正在运行的文件数（唯一的共享准入资源）
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
    wake: Notify,
    shutdown: CancellationToken,
}

/// 并发槽位守卫，Drop 时归还槽位并唤醒调度循环
struct SlotGuard {
    inner: Arc<SchedulerInner>,
    wake_on_release: bool,
}

impl SlotGuard {
    /// 归还一个未使用的槽位（不触发调度）
    fn release_unused(mut self) {
        self.wake_on_release = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        if self.wake_on_release {
            self.inner.wake.notify_one();
        }
    }
}

impl SchedulerInner {
    /// CAS 获取槽位，已满时返回 None
    fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_concurrent.load(Ordering::SeqCst) {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(SlotGuard {
                        inner: self.clone(),
                        wake_on_release: true,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// 取出下一个仍处于排队状态的文件
    fn next_job(&self) -> Option<ScheduledFile> {
        let mut queues = self.queues.lock();
        while let Some(job) = queues.pop_next() {
            let file = job.file.lock();
            if file.phase == UploadPhase::Queued && !file.cancel_token.is_cancelled() {
                drop(file);
                return Some(job);
            }
            debug!("跳过已不在排队状态的文件: {}", file.name);
        }
        None
    }

    fn enqueue(&self, job: ScheduledFile) -> bool {
        let added = self.queues.lock().push(job);
        if added {
            self.wake.notify_one();
        }
        added
    }

    /// 尽可能多地准入排队文件
    fn dispatch(self: &Arc<Self>) {
        loop {
            let Some(slot) = self.try_acquire() else {
                break;
            };
            let Some(job) = self.next_job() else {
                slot.release_unused();
                break;
            };
            debug!(
                "准入文件: batch={}, index={}, active={}/{}",
                job.batch_id,
                job.file_index,
                self.active.load(Ordering::SeqCst),
                self.max_concurrent.load(Ordering::SeqCst)
            );
            let inner = self.clone();
            tokio::spawn(async move { inner.run_job(slot, job).await });
        }
    }

    async fn run_job(self: Arc<Self>, slot: SlotGuard, job: ScheduledFile) {
        let task = ChunkedUploadTask::new(
            job.file.clone(),
            job.destination.clone(),
            self.api.clone(),
            self.config.clone(),
            self.notifier.clone(),
        );

        let outcome = match tokio::spawn(task.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("上传任务异常退出: batch={}, 错误: {}", job.batch_id, e);
                let mut file = job.file.lock();
                if !file.is_terminal() {
                    file.record_failure(FileError::fatal(format!("上传任务异常退出: {}", e)));
                }
                drop(file);
                self.notifier.mark_dirty();
                TaskOutcome::Failed { retry_after: None }
            }
        };

        // 先归还槽位，再安排重试
        drop(slot);

        if let TaskOutcome::Failed {
            retry_after: Some(delay),
        } = outcome
        {
            self.schedule_retry(job, delay);
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: ScheduledFile, delay: Duration) {
        let inner = self.clone();
        let token = job.file.lock().cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let still_queued = {
                let file = job.file.lock();
                file.phase == UploadPhase::Queued && !file.cancel_token.is_cancelled()
            };
            if still_queued {
                debug!("退避结束，重新入队: batch={}, index={}", job.batch_id, job.file_index);
                inner.enqueue(job);
            }
        });
    }
}

/// 全局上传调度器
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<SchedulerInner>,
}

impl UploadScheduler {
    /// 创建调度器并启动调度循环
    pub fn new(api: Arc<dyn UploadApi>, config: Arc<UploadConfig>, notifier: Notifier) -> Self {
        let max_concurrent = config.max_concurrent_uploads.max(1);
        let inner = Arc::new(SchedulerInner {
            api,
            config,
            notifier,
            queues: Mutex::new(ReadyQueues::default()),
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(max_concurrent),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        Self::start_scheduling(inner.clone());
        info!("全局上传调度循环已启动: 最大并发={}", max_concurrent);

        Self { inner }
    }

    fn start_scheduling(inner: Arc<SchedulerInner>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.wake.notified() => inner.dispatch(),
                }
            }
            info!("全局上传调度循环已停止");
        });
    }

    /// 文件入队
    pub fn enqueue(&self, job: ScheduledFile) -> bool {
        self.inner.enqueue(job)
    }

    /// 移除某批次所有排队中的文件
    pub fn remove_batch(&self, batch_id: &str) -> usize {
        self.inner.queues.lock().remove_batch(batch_id)
    }

    /// 移除一个排队中的文件
    pub fn remove_file(&self, batch_id: &str, file_index: usize) -> bool {
        self.inner.queues.lock().remove_file(batch_id, file_index)
    }

    /// 动态调整最大并发数
    pub fn update_max_concurrent(&self, new_max: usize) {
        let new_max = new_max.max(1);
        let old = self.inner.max_concurrent.swap(new_max, Ordering::SeqCst);
        info!("调整最大并发上传数: {} -> {}", old, new_max);
        self.inner.wake.notify_one();
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst)
    }

    /// 正在运行的文件数
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// 排队中的文件数
    pub fn queued_count(&self) -> usize {
        self.inner.queues.lock().len()
    }

    /// 停止调度循环
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}
