// 上传批次与快照

use crate::uploader::progress::{FileProgress, ProgressAggregator};
use crate::uploader::task::{FileError, FileInput, FileStatus, UploadFile, UploadPhase};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 共享的文件状态
pub type SharedFile = Arc<Mutex<UploadFile>>;

/// 上传批次
///
/// 创建后文件列表和总字节数不再变化
#[derive(Debug)]
pub struct UploadBatch {
    pub id: String,
    /// 创建顺序号，用于调度公平性
    pub seq: u64,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 目标容器 ID
    pub destination: String,
    pub files: Vec<SharedFile>,
    /// 批次令牌，每个文件持有其子令牌
    pub cancel_token: CancellationToken,
    progress: ProgressAggregator,
}

impl UploadBatch {
    pub fn new(seq: u64, destination: String, inputs: Vec<FileInput>) -> Self {
        let cancel_token = CancellationToken::new();
        let total_bytes = inputs.iter().map(|f| f.size).fold(0u64, u64::saturating_add);
        let files = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                Arc::new(Mutex::new(UploadFile::new(
                    index,
                    input,
                    cancel_token.child_token(),
                )))
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            seq,
            created_at: chrono::Utc::now().timestamp(),
            destination,
            files,
            cancel_token,
            progress: ProgressAggregator::new(total_bytes),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.progress.total_bytes()
    }

    /// 按 ID 查找文件
    pub fn file(&self, file_id: &str) -> Option<SharedFile> {
        self.files.iter().find(|f| f.lock().id == file_id).cloned()
    }

    /// 所有文件都已进入终态
    pub fn is_finished(&self) -> bool {
        self.files.iter().all(|f| f.lock().is_terminal())
    }

    /// 生成当前快照
    ///
    /// 逐个短暂加锁，不会跨文件持锁
    pub fn snapshot(&self) -> BatchSnapshot {
        let (files, samples): (Vec<FileSnapshot>, Vec<FileProgress>) = self
            .files
            .iter()
            .map(|f| {
                let file = f.lock();
                let sample = FileProgress {
                    confirmed_bytes: file.peak_uploaded_bytes,
                    admitted_at: file.admitted_at,
                    progressed_at: file.progressed_at,
                };
                (FileSnapshot::from(&*file), sample)
            })
            .unzip();

        let stats = self.progress.measure(samples);
        let count = |status: FileStatus| files.iter().filter(|f| f.status == status).count();

        BatchSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            destination: self.destination.clone(),
            total_files: files.len(),
            total_bytes: self.total_bytes(),
            uploaded_bytes: stats.uploaded_bytes,
            queued_files: count(FileStatus::Queued),
            active_files: count(FileStatus::Uploading) + count(FileStatus::Processing),
            completed_files: count(FileStatus::Success),
            failed_files: count(FileStatus::Failed),
            cancelled_files: count(FileStatus::Cancelled),
            average_speed: stats.average_speed,
            eta_secs: stats.eta_secs,
            files,
        }
    }
}

/// 批次快照（推送给订阅者的数据）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSnapshot {
    pub id: String,
    pub created_at: i64,
    pub destination: String,
    pub total_files: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub queued_files: usize,
    /// 上传中 + 处理中
    pub active_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
    /// 平均速度 (bytes/s)
    pub average_speed: u64,
    /// 预计剩余秒数，None 表示已完成
    pub eta_secs: Option<u64>,
    pub files: Vec<FileSnapshot>,
}

impl BatchSnapshot {
    /// 所有文件都已进入终态
    pub fn is_finished(&self) -> bool {
        self.completed_files + self.failed_files + self.cancelled_files == self.total_files
    }
}

/// 文件快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSnapshot {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub status: FileStatus,
    pub phase: UploadPhase,
    pub progress: u8,
    pub attempts: u32,
    pub last_error: Option<FileError>,
    /// 当前会话已确认字节数
    pub uploaded_bytes: u64,
    /// 计入批次进度的字节数（历史最大值）
    pub counted_bytes: u64,
    pub parts_uploaded: usize,
    pub upload_id: Option<String>,
    pub key: Option<String>,
    pub asset_id: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl From<&UploadFile> for FileSnapshot {
    fn from(file: &UploadFile) -> Self {
        Self {
            id: file.id.clone(),
            name: file.name.clone(),
            size: file.size,
            content_type: file.content_type.clone(),
            status: file.status(),
            phase: file.phase,
            progress: file.progress,
            attempts: file.attempts,
            last_error: file.last_error.clone(),
            uploaded_bytes: file.uploaded_bytes,
            counted_bytes: file.peak_uploaded_bytes,
            parts_uploaded: file.parts.len(),
            upload_id: file.session.as_ref().map(|s| s.upload_id.clone()),
            key: file.session.as_ref().map(|s| s.key.clone()),
            asset_id: file.asset_id.clone(),
            started_at: file.started_at,
            completed_at: file.completed_at,
        }
    }
}
