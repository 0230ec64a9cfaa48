//! 快照推送
//!
//! 状态变更只标记"脏"并唤醒推送任务；推送任务每次被唤醒时生成一份完整快照。
//! 生成快照期间到达的唤醒会保留一个许可，触发下一轮推送，因此一轮突发变更之后的
//! 最终状态一定会被发布，中间状态可能被合并。

use crate::events::{ProgressThrottler, UploadEvent};
use crate::uploader::BatchSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct NotifierInner {
    dirty: Notify,
    tx: watch::Sender<UploadEvent>,
    throttler: ProgressThrottler,
    shutdown: CancellationToken,
}

/// 一对多的批次快照推送器
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl Notifier {
    /// 创建推送器，`interval` 为两次推送的最小间隔
    pub fn new(interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(UploadEvent::default());
        Self {
            inner: Arc::new(NotifierInner {
                dirty: Notify::new(),
                tx,
                throttler: ProgressThrottler::new(interval),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 启动推送任务
    ///
    /// `snapshot` 在每一轮推送时调用；返回 None 表示数据源已释放，推送任务随之退出
    pub fn start<F>(&self, snapshot: F)
    where
        F: Fn() -> Option<Vec<BatchSnapshot>> + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.dirty.notified() => {}
                }

                if let Some(wait) = inner.throttler.remaining() {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }

                let Some(batches) = snapshot() else {
                    break;
                };
                inner.throttler.force_emit();
                inner.tx.send_replace(UploadEvent::BatchesChanged { batches });

                if inner.shutdown.is_cancelled() {
                    break;
                }
            }
            debug!("快照推送任务已退出");
        });
    }

    /// 标记状态已变化
    pub fn mark_dirty(&self) {
        self.inner.dirty.notify_one();
    }

    /// 订阅快照
    ///
    /// 订阅后会先收到当前快照
    pub fn subscribe(&self) -> Subscription {
        let mut rx = self.inner.tx.subscribe();
        let initial = rx.borrow_and_update().clone();
        Subscription {
            rx,
            pending: Some(initial),
        }
    }

    /// 立即发布一份快照（不经过节流）
    pub fn publish(&self, batches: Vec<BatchSnapshot>) {
        self.inner.throttler.force_emit();
        self.inner.tx.send_replace(UploadEvent::BatchesChanged { batches });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// 停止推送任务
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// 快照订阅
///
/// 丢弃或调用 [`Subscription::unsubscribe`] 即停止接收
pub struct Subscription {
    rx: watch::Receiver<UploadEvent>,
    pending: Option<UploadEvent>,
}

impl Subscription {
    /// 等待下一份快照，推送器关闭后返回 None
    pub async fn recv(&mut self) -> Option<UploadEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// 不等待，直接读取最新快照
    pub fn current(&mut self) -> UploadEvent {
        self.pending = None;
        self.rx.borrow_and_update().clone()
    }

    pub fn unsubscribe(self) {}
}
