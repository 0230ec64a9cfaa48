// Gallery Uploader Library
// 图库批量上传编排核心库

// 配置管理模块
pub mod config;

// 批次快照推送模块
pub mod events;

// 日志模块
pub mod logging;

// 远端上传 API 模块
pub mod remote;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, OrphanPolicy, UploadConfig};
pub use events::{Notifier, Subscription, UploadEvent};
pub use remote::{HttpUploadApi, RemoteError, RemoteErrorKind, UploadApi};
pub use uploader::{
    BatchController, BatchSnapshot, ControllerError, FileInput, FileSnapshot, FileStatus,
    UploadPhase, ValidationError,
};
