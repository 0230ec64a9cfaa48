//! 推送事件类型定义

use crate::uploader::BatchSnapshot;
use serde::{Deserialize, Serialize};

/// 上传事件
///
/// 每次推送都携带所有批次的完整快照，而不是增量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 批次集合发生变化（新增、删除、状态或进度更新）
    BatchesChanged { batches: Vec<BatchSnapshot> },
}

impl UploadEvent {
    pub fn batches(&self) -> &[BatchSnapshot] {
        match self {
            UploadEvent::BatchesChanged { batches } => batches,
        }
    }

    pub fn into_batches(self) -> Vec<BatchSnapshot> {
        match self {
            UploadEvent::BatchesChanged { batches } => batches,
        }
    }
}

impl Default for UploadEvent {
    fn default() -> Self {
        UploadEvent::BatchesChanged {
            batches: Vec::new(),
        }
    }
}
