// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 远端 API 配置
    #[serde(default)]
    pub remote: RemoteConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 远端对象被定稿但登记失败时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// 保留远端对象和会话，重试时直接进入登记阶段
    Retain,
    /// 尽力删除远端对象，重试时从 INIT 重新开始
    Delete,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 单文件大小上限（字节）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 单批次最大文件数
    #[serde(default = "default_max_files_per_batch")]
    pub max_files_per_batch: usize,
    /// 单批次总大小上限（字节）
    #[serde(default = "default_max_total_batch_size")]
    pub max_total_batch_size: u64,
    /// 全局最大并发上传数（所有批次共享）
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 文件级最大尝试次数
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// 支持的扩展名（不区分大小写，不含点）
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,
    /// 单个分片的最大重试次数（不计入文件 attempts）
    #[serde(default = "default_part_max_retries")]
    pub part_max_retries: u32,
    /// 单个分片操作超时（秒）
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,
    /// 分片级初始退避延迟（毫秒）
    #[serde(default = "default_base_part_backoff_ms")]
    pub base_part_backoff_ms: u64,
    /// 文件级初始退避延迟（毫秒）
    #[serde(default = "default_base_file_backoff_ms")]
    pub base_file_backoff_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 限流时的最小等待时间（毫秒）
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    /// 状态推送最小间隔（毫秒），0 表示不节流
    #[serde(default = "default_notify_interval_ms")]
    pub notify_interval_ms: u64,
    /// 登记失败后的孤儿对象策略
    #[serde(default = "default_orphan_policy")]
    pub orphan_policy: OrphanPolicy,
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    5 * 1024 * 1024
}

fn default_max_files_per_batch() -> usize {
    100
}

fn default_max_total_batch_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_supported_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tif", "tiff", "avif",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_part_max_retries() -> u32 {
    3
}

fn default_part_timeout_secs() -> u64 {
    60
}

fn default_base_part_backoff_ms() -> u64 {
    200
}

fn default_base_file_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_rate_limit_backoff_ms() -> u64 {
    5000
}

fn default_notify_interval_ms() -> u64 {
    200
}

fn default_orphan_policy() -> OrphanPolicy {
    OrphanPolicy::Retain
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            chunk_size: default_chunk_size(),
            max_files_per_batch: default_max_files_per_batch(),
            max_total_batch_size: default_max_total_batch_size(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            max_retry_attempts: default_max_retry_attempts(),
            supported_extensions: default_supported_extensions(),
            part_max_retries: default_part_max_retries(),
            part_timeout_secs: default_part_timeout_secs(),
            base_part_backoff_ms: default_base_part_backoff_ms(),
            base_file_backoff_ms: default_base_file_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            notify_interval_ms: default_notify_interval_ms(),
            orphan_policy: default_orphan_policy(),
        }
    }
}

impl UploadConfig {
    /// 校验配置是否可用
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size 必须大于 0");
        }
        if self.max_concurrent_uploads == 0 {
            anyhow::bail!("max_concurrent_uploads 必须大于 0");
        }
        if self.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts 必须大于 0");
        }
        Ok(())
    }

    /// 单个分片操作超时
    pub fn part_timeout(&self) -> Duration {
        Duration::from_secs(self.part_timeout_secs)
    }

    /// 扩展名是否在白名单中（不区分大小写）
    pub fn is_extension_supported(&self, ext: &str) -> bool {
        self.supported_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// 远端 API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// API 根地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer 令牌
    #[serde(default)]
    pub api_token: Option<String>,
    /// 普通请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_url() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("gallery-uploader/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传参数校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.upload
            .validate()
            .context("保存配置失败：上传参数校验失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 仅在文件不存在时写出默认配置，避免覆盖用户写错的文件
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
