// 上传引擎模块
//
// - 批次准入校验（文件大小、扩展名、批次总量）
// - 全局上传调度器（Round-Robin 公平调度，全局并发上限）
// - 分片上传状态机（INIT → 分片 → 合并 → 预览 → 登记）
// - 两级重试：分片级指数退避，文件级自动重新排队
// - 批次进度聚合（已确认字节、平均速度、剩余时间）

pub mod batch;
pub mod chunk;
pub mod engine;
pub mod manager;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod task;
pub mod validation;

#[cfg(test)]
pub(crate) mod mock;

pub use batch::{BatchSnapshot, FileSnapshot, SharedFile, UploadBatch};
pub use chunk::{progress_percent, PartList, UploadChunk, UploadChunkManager, UploadedPart};
pub use engine::{ChunkedUploadTask, TaskOutcome, UploadError};
pub use manager::{BatchController, ControllerError};
pub use progress::{FileProgress, ProgressAggregator, ProgressStats};
pub use retry::BackoffPolicy;
pub use scheduler::{ScheduledFile, UploadScheduler};
pub use task::{
    content_type_for, FileError, FileErrorKind, FileInput, FileSource, FileStatus, UploadFile,
    UploadPhase,
};
pub use validation::{validate_batch, BatchIssue, FileIssue, RejectedFile, ValidationError};
