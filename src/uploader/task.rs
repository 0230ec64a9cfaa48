// 单文件上传状态
//
// 文件只通过调度器/上传流水线以及控制器的取消、重试操作变更

use crate::remote::{RemoteError, RemoteErrorKind, UploadSession};
use crate::uploader::chunk::{progress_percent, PartList};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 对外展示的文件状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// 排队中
    Queued,
    /// 上传中（INIT / 分片上传 / 提交）
    Uploading,
    /// 处理中（预览生成 / 资产登记）
    Processing,
    /// 成功
    Success,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Success | FileStatus::Failed | FileStatus::Cancelled
        )
    }
}

/// 上传状态机阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Queued,
    Init,
    UploadingParts,
    Completing,
    Postprocessing,
    Registering,
    Success,
    Failed,
    Cancelled,
}

impl UploadPhase {
    pub fn status(&self) -> FileStatus {
        match self {
            UploadPhase::Queued => FileStatus::Queued,
            UploadPhase::Init | UploadPhase::UploadingParts | UploadPhase::Completing => {
                FileStatus::Uploading
            }
            UploadPhase::Postprocessing | UploadPhase::Registering => FileStatus::Processing,
            UploadPhase::Success => FileStatus::Success,
            UploadPhase::Failed => FileStatus::Failed,
            UploadPhase::Cancelled => FileStatus::Cancelled,
        }
    }
}

/// 待上传文件的数据来源
#[derive(Clone)]
pub enum FileSource {
    /// 内存中的字节
    Memory(Bytes),
    /// 本地文件路径
    Path(PathBuf),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            FileSource::Path(path) => write!(f, "Path({:?})", path),
        }
    }
}

impl FileSource {
    /// 读取指定范围的字节
    ///
    /// 数据不足时返回 UnexpectedEof
    pub async fn read_range(&self, range: Range<u64>) -> std::io::Result<Bytes> {
        let len = (range.end - range.start) as usize;
        match self {
            FileSource::Memory(bytes) => {
                let start = range.start as usize;
                let end = range.end as usize;
                if end > bytes.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("源数据只有 {} 字节，请求范围 {}..{}", bytes.len(), start, end),
                    ));
                }
                Ok(bytes.slice(start..end))
            }
            FileSource::Path(path) => {
                if len == 0 {
                    return Ok(Bytes::new());
                }
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

/// 调用方提交的一个文件
#[derive(Debug, Clone)]
pub struct FileInput {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub source: FileSource,
}

impl FileInput {
    /// 由内存字节构造，大小取字节长度
    pub fn from_bytes(name: impl Into<String>, content_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            content_type: content_type.into(),
            source: FileSource::Memory(data),
        }
    }

    /// 由本地文件构造，大小取文件元数据
    pub async fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let content_type = content_type_for(&name).to_string();
        Ok(Self {
            name,
            size: metadata.len(),
            content_type,
            source: FileSource::Path(path),
        })
    }

    /// 文件扩展名（不含点），没有扩展名时返回 None
    pub fn extension(&self) -> Option<&str> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext)
    }
}

/// 根据扩展名推断 MIME 类型
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "tif" | "tiff" => "image/tiff",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

/// 失败类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    /// 可重试的远端错误
    Transient,
    /// 不可重试的错误
    Fatal,
    /// 对象已定稿但资产登记失败
    Registration,
}

/// 文件的最近一次错误
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileError {
    pub kind: FileErrorKind,
    /// 远端错误细分（本地错误时为空）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_kind: Option<RemoteErrorKind>,
    pub message: String,
}

impl FileError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FileErrorKind::Fatal,
            remote_kind: None,
            message: message.into(),
        }
    }

    pub fn from_remote(kind: FileErrorKind, error: &RemoteError) -> Self {
        Self {
            kind,
            remote_kind: Some(error.kind),
            message: error.message.clone(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FileErrorKind::Transient
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_kind {
            Some(kind) => write!(f, "{:?}({}): {}", self.kind, kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// 批次中的一个文件
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// 文件 ID
    pub id: String,
    /// 在批次中的位置
    pub index: usize,
    pub name: String,
    /// 声明的字节数
    pub size: u64,
    pub content_type: String,
    pub source: FileSource,
    /// 状态机阶段
    pub phase: UploadPhase,
    /// 进度百分比 (0-100)，同一次尝试内单调不减
    pub progress: u8,
    /// 文件级失败次数
    pub attempts: u32,
    pub last_error: Option<FileError>,
    /// 远端会话（INIT 后设置）
    pub session: Option<UploadSession>,
    /// 已确认分片
    pub parts: PartList,
    /// 已确认字节数
    pub uploaded_bytes: u64,
    /// 已确认字节数的历史最大值
    pub peak_uploaded_bytes: u64,
    /// 远端对象已定稿但尚未登记
    pub finalized: bool,
    pub asset_id: Option<String>,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 首次被调度器准入的时刻
    pub admitted_at: Option<Instant>,
    /// 最近一次已确认字节增长的时刻
    pub progressed_at: Option<Instant>,
    /// 取消令牌（批次令牌的子令牌）
    pub cancel_token: CancellationToken,
}

impl UploadFile {
    pub fn new(index: usize, input: FileInput, cancel_token: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            index,
            name: input.name,
            size: input.size,
            content_type: input.content_type,
            source: input.source,
            phase: UploadPhase::Queued,
            progress: 0,
            attempts: 0,
            last_error: None,
            session: None,
            parts: PartList::new(),
            uploaded_bytes: 0,
            peak_uploaded_bytes: 0,
            finalized: false,
            asset_id: None,
            started_at: None,
            completed_at: None,
            admitted_at: None,
            progressed_at: None,
            cancel_token,
        }
    }

    pub fn status(&self) -> FileStatus {
        self.phase.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// 开始一次新的尝试
    ///
    /// 进度从已确认分片重新计算
    pub fn begin_attempt(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
        if self.admitted_at.is_none() {
            self.admitted_at = Some(Instant::now());
        }
        self.completed_at = None;
        self.progress = self.computed_progress();
    }

    /// 切换阶段
    pub fn enter(&mut self, phase: UploadPhase) {
        self.phase = phase;
    }

    /// 记录 INIT 得到的会话
    pub fn set_session(&mut self, session: UploadSession) {
        self.session = Some(session);
        self.parts.clear();
        self.uploaded_bytes = 0;
        self.finalized = false;
    }

    /// 作废会话及其已确认分片
    ///
    /// 进度不回退，高水位保持不变
    pub fn clear_session(&mut self) {
        self.session = None;
        self.parts.clear();
        self.uploaded_bytes = 0;
        self.finalized = false;
    }

    /// 记录一个已确认的分片
    pub fn record_part(&mut self, part_number: u32, etag: String, size: u64) {
        self.parts.record(part_number, etag, size);
        self.uploaded_bytes = self.parts.confirmed_bytes();
        self.raise_peak(self.uploaded_bytes);
        self.progress = self.progress.max(self.computed_progress());
    }

    /// 对象定稿
    pub fn mark_finalized(&mut self) {
        self.finalized = true;
        self.uploaded_bytes = self.size;
        self.raise_peak(self.size);
        self.progress = 100;
    }

    /// 已确认字节的高水位只增不减，增长时记录时刻
    fn raise_peak(&mut self, bytes: u64) {
        if bytes > self.peak_uploaded_bytes {
            self.peak_uploaded_bytes = bytes;
            self.progressed_at = Some(Instant::now());
        }
    }

    /// 标记为成功
    pub fn mark_success(&mut self, asset_id: String) {
        self.phase = UploadPhase::Success;
        self.asset_id = Some(asset_id);
        self.finalized = false;
        self.progress = 100;
        self.last_error = None;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 记录一次文件级失败，返回累计失败次数
    pub fn record_failure(&mut self, error: FileError) -> u32 {
        self.attempts += 1;
        self.last_error = Some(error);
        self.phase = UploadPhase::Failed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.attempts
    }

    /// 自动重试：回到排队状态
    pub fn requeue(&mut self) {
        self.phase = UploadPhase::Queued;
        self.completed_at = None;
    }

    /// 标记为已取消，已处于终态时返回 false
    pub fn mark_cancelled(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.cancel_token.cancel();
        self.phase = UploadPhase::Cancelled;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        true
    }

    fn computed_progress(&self) -> u8 {
        if self.finalized {
            return 100;
        }
        if self.size == 0 {
            return if self.parts.is_empty() { 0 } else { 100 };
        }
        progress_percent(self.uploaded_bytes, self.size)
    }
}
