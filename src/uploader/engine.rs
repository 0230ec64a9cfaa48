// 单文件分片上传状态机
//
// 流程：INIT → UPLOADING_PARTS → COMPLETING → POSTPROCESSING → REGISTERING
//
// - 分片严格按编号顺序串行上传，单个分片的瞬时错误在分片级重试，不计入 attempts
// - 会话过期时清空会话和分片，在同一次运行内从 INIT 重新开始（最多一次）
// - 所有远端调用都与取消令牌竞争；每次写回状态前在文件锁内重新检查令牌，
//   取消后到达的响应一律丢弃

use crate::config::{OrphanPolicy, UploadConfig};
use crate::events::Notifier;
use crate::remote::{RemoteError, UploadApi, UploadSession};
use crate::uploader::batch::SharedFile;
use crate::uploader::chunk::{UploadChunk, UploadChunkManager};
use crate::uploader::retry::BackoffPolicy;
use crate::uploader::task::{FileError, FileErrorKind, FileSource, UploadFile, UploadPhase};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 上传过程中的错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("读取源文件失败: {0}")]
    Source(#[from] std::io::Error),
    #[error("资产登记失败: {0}")]
    Registration(RemoteError),
    #[error("上传已取消")]
    Cancelled,
}

impl UploadError {
    /// 转换为记录在文件上的错误
    pub fn to_file_error(&self) -> FileError {
        match self {
            UploadError::Remote(e) if e.is_retriable() || e.is_session_expired() => {
                FileError::from_remote(FileErrorKind::Transient, e)
            }
            UploadError::Remote(e) => FileError::from_remote(FileErrorKind::Fatal, e),
            UploadError::Registration(e) => FileError::from_remote(FileErrorKind::Registration, e),
            UploadError::Source(e) => FileError::fatal(format!("读取源文件失败: {}", e)),
            UploadError::Cancelled => FileError::fatal("上传已取消"),
        }
    }
}

/// 一次运行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// `retry_after` 为 Some 时文件已回到排队状态，等待后自动重试
    Failed { retry_after: Option<Duration> },
    Cancelled,
}

/// 单文件上传任务
pub struct ChunkedUploadTask {
    file: SharedFile,
    destination: String,
    api: Arc<dyn UploadApi>,
    config: Arc<UploadConfig>,
    backoff: BackoffPolicy,
    notifier: Notifier,
    token: CancellationToken,
}

impl ChunkedUploadTask {
    pub fn new(
        file: SharedFile,
        destination: String,
        api: Arc<dyn UploadApi>,
        config: Arc<UploadConfig>,
        notifier: Notifier,
    ) -> Self {
        let token = file.lock().cancel_token.clone();
        let backoff = BackoffPolicy::from(config.as_ref());
        Self {
            file,
            destination,
            api,
            config,
            backoff,
            notifier,
            token,
        }
    }

    /// 运行一次完整尝试
    pub async fn run(self) -> TaskOutcome {
        let name = self.file.lock().name.clone();

        let start = self.commit(|f| {
            if f.is_terminal() {
                return None;
            }
            f.begin_attempt();
            let phase = if f.finalized && f.session.is_some() {
                UploadPhase::Registering
            } else {
                UploadPhase::Init
            };
            f.enter(phase);
            Some(phase)
        });
        let start = match start {
            Ok(Some(phase)) => phase,
            Ok(None) | Err(_) => return TaskOutcome::Cancelled,
        };

        info!("开始上传: name={}, 起始阶段={:?}", name, start);

        match self.execute().await {
            Ok(asset_id) => match self.commit(|f| f.mark_success(asset_id.clone())) {
                Ok(()) => {
                    info!("上传完成: name={}, asset_id={}", name, asset_id);
                    TaskOutcome::Success
                }
                Err(_) => TaskOutcome::Cancelled,
            },
            Err(UploadError::Cancelled) => {
                info!("上传已取消: name={}", name);
                TaskOutcome::Cancelled
            }
            Err(e) => self.fail(&name, e),
        }
    }

    async fn execute(&self) -> Result<String, UploadError> {
        let finalized = self.file.lock().finalized;
        if !finalized {
            self.transfer_with_restart().await?;
            self.commit(|f| {
                f.mark_finalized();
                f.enter(UploadPhase::Postprocessing);
            })?;
            self.postprocess().await?;
        }
        self.register().await
    }

    /// INIT → UPLOADING_PARTS → COMPLETING，会话过期时重启一次
    async fn transfer_with_restart(&self) -> Result<(), UploadError> {
        let mut restarted = false;
        loop {
            match self.transfer().await {
                Err(UploadError::Remote(e)) if e.is_session_expired() => {
                    self.commit(|f| {
                        f.clear_session();
                        f.enter(UploadPhase::Init);
                    })?;
                    if restarted {
                        return Err(UploadError::Remote(e));
                    }
                    warn!("上传会话已过期，从 INIT 重新开始: {}", e);
                    restarted = true;
                }
                other => return other,
            }
        }
    }

    async fn transfer(&self) -> Result<(), UploadError> {
        let (name, content_type, existing) = {
            let f = self.file.lock();
            (f.name.clone(), f.content_type.clone(), f.session.clone())
        };

        let session = match existing {
            Some(session) => {
                debug!("复用已有会话: upload_id={}", session.upload_id);
                self.commit(|f| f.enter(UploadPhase::UploadingParts))?;
                session
            }
            None => {
                self.commit(|f| f.enter(UploadPhase::Init))?;
                let session = self
                    .guarded(self.api.create_upload_session(&name, &content_type), None)
                    .await?;
                info!(
                    "会话已创建: name={}, upload_id={}, key={}",
                    name, session.upload_id, session.key
                );
                self.commit(|f| {
                    f.set_session(session.clone());
                    f.enter(UploadPhase::UploadingParts);
                })?;
                session
            }
        };

        self.upload_parts(&session).await?;

        self.commit(|f| f.enter(UploadPhase::Completing))?;
        let parts = self.file.lock().parts.to_completed_parts();
        let (parts, session) = (&parts, &session);
        let completed = self
            .with_retry("提交分片列表", || async move {
                self.api
                    .complete_upload(&session.key, &session.upload_id, parts)
                    .await
                    .map_err(UploadError::from)
            })
            .await;

        if let Err(UploadError::Remote(e)) = &completed {
            if !e.is_retriable() && !e.is_session_expired() {
                // 不可重试的提交失败作废整个会话，下次从 INIT 开始
                self.commit(|f| f.clear_session())?;
            }
        }
        completed
    }

    async fn upload_parts(&self, session: &UploadSession) -> Result<(), UploadError> {
        let (size, source, total, pending) = {
            let f = self.file.lock();
            let plan = UploadChunkManager::new(f.size, self.config.chunk_size);
            let pending: Vec<UploadChunk> = plan.pending(&f.parts).cloned().collect();
            (f.size, f.source.clone(), plan.chunk_count(), pending)
        };

        debug!(
            "待上传分片: {}/{} 个 (文件大小 {} bytes, 分片大小 {} bytes)",
            pending.len(),
            total,
            size,
            self.config.chunk_size
        );

        for chunk in pending {
            let data = read_chunk(&source, &chunk).await?;
            let etag = self.upload_part(session, &chunk, data).await?;
            let progress = self.commit(|f| {
                f.record_part(chunk.part_number, etag.clone(), chunk.size());
                f.progress
            })?;
            debug!(
                "[分片#{}] ✓ 上传成功 (大小: {} bytes, 进度: {}%)",
                chunk.part_number,
                chunk.size(),
                progress
            );
        }
        Ok(())
    }

    /// 签名并上传一个分片
    async fn upload_part(
        &self,
        session: &UploadSession,
        chunk: &UploadChunk,
        data: Bytes,
    ) -> Result<String, UploadError> {
        let part_timeout = Some(self.config.part_timeout());
        let label = format!("分片#{}", chunk.part_number);
        self.with_retry(&label, || {
            let data = data.clone();
            async move {
                let target = self
                    .timed(
                        self.api
                            .sign_part(&session.upload_id, &session.key, chunk.part_number),
                        part_timeout,
                    )
                    .await?;
                self.timed(self.api.put_part(&target, data), part_timeout)
                    .await
            }
        })
        .await
    }

    async fn postprocess(&self) -> Result<(), UploadError> {
        let key = self.session_key()?;
        match self
            .guarded(self.api.generate_preview(&key, &self.destination), None)
            .await
        {
            Ok(()) => Ok(()),
            Err(UploadError::Cancelled) => Err(UploadError::Cancelled),
            Err(e) => {
                warn!("生成预览失败（忽略）: key={}, 错误: {}", key, e);
                Ok(())
            }
        }
    }

    async fn register(&self) -> Result<String, UploadError> {
        self.commit(|f| f.enter(UploadPhase::Registering))?;
        let key = self.session_key()?;
        let (name, size) = {
            let f = self.file.lock();
            (f.name.clone(), f.size)
        };

        match self
            .guarded(
                self.api.register_asset(&key, &name, &self.destination, size),
                None,
            )
            .await
        {
            Ok(asset_id) => Ok(asset_id),
            Err(UploadError::Remote(e)) => {
                error!("资产登记失败: name={}, key={}, 错误: {}", name, key, e);
                if self.config.orphan_policy == OrphanPolicy::Delete {
                    self.discard_orphan(&key).await;
                    self.commit(|f| f.clear_session())?;
                }
                Err(UploadError::Registration(e))
            }
            Err(e) => Err(e),
        }
    }

    async fn discard_orphan(&self, key: &str) {
        match self.guarded(self.api.delete_object(key), None).await {
            Ok(()) => info!("已删除未登记的远端对象: key={}", key),
            Err(e) => warn!("删除未登记的远端对象失败: key={}, 错误: {}", key, e),
        }
    }

    /// 记录失败，决定是否自动重试
    fn fail(&self, name: &str, error: UploadError) -> TaskOutcome {
        let file_error = error.to_file_error();
        let max_attempts = self.config.max_retry_attempts;

        let recorded = self.commit(|f| {
            let attempts = f.record_failure(file_error.clone());
            let retry = file_error.is_transient() && attempts < max_attempts;
            if retry {
                f.requeue();
            }
            (attempts, retry)
        });

        match recorded {
            Ok((attempts, true)) => {
                let delay = self.backoff.file_delay(attempts);
                warn!(
                    "上传失败，{:?} 后自动重试 ({}/{}): name={}, 错误: {}",
                    delay, attempts, max_attempts, name, file_error
                );
                TaskOutcome::Failed {
                    retry_after: Some(delay),
                }
            }
            Ok((attempts, false)) => {
                error!(
                    "上传失败 (attempts={}/{}): name={}, 错误: {}",
                    attempts, max_attempts, name, file_error
                );
                TaskOutcome::Failed { retry_after: None }
            }
            Err(_) => TaskOutcome::Cancelled,
        }
    }

    fn session_key(&self) -> Result<String, UploadError> {
        self.file
            .lock()
            .session
            .as_ref()
            .map(|s| s.key.clone())
            .ok_or_else(|| UploadError::Remote(RemoteError::malformed("缺少上传会话")))
    }

    /// 在文件锁内写回状态；已取消时放弃写入
    fn commit<R>(&self, update: impl FnOnce(&mut UploadFile) -> R) -> Result<R, UploadError> {
        let result = {
            let mut file = self.file.lock();
            if self.token.is_cancelled() || file.phase == UploadPhase::Cancelled {
                return Err(UploadError::Cancelled);
            }
            update(&mut file)
        };
        self.notifier.mark_dirty();
        Ok(result)
    }

    /// 远端调用与取消令牌竞争
    async fn guarded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
        limit: Option<Duration>,
    ) -> Result<T, UploadError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(UploadError::Cancelled),
            result = self.timed(call, limit) => result,
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
        limit: Option<Duration>,
    ) -> Result<T, UploadError> {
        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::timeout(format!("操作超过 {:?} 未完成", limit))),
            },
            None => call.await,
        };
        result.map_err(UploadError::from)
    }

    /// 分片级重试：只重试可重试的远端错误，不计入 attempts
    async fn with_retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let max_retries = self.config.part_max_retries;
        let mut retry = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(UploadError::Cancelled),
                result = op() => result,
            };

            match result {
                Err(UploadError::Remote(e)) if e.is_retriable() && retry < max_retries => {
                    let delay = self.backoff.part_delay(retry, e.kind);
                    warn!(
                        "[{}] 失败，等待 {:?} 后重试 ({}/{}): {}",
                        label,
                        delay,
                        retry + 1,
                        max_retries,
                        e
                    );
                    retry += 1;
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

async fn read_chunk(source: &FileSource, chunk: &UploadChunk) -> Result<Bytes, UploadError> {
    let data = source.read_range(chunk.range.clone()).await?;
    if data.len() as u64 != chunk.size() {
        return Err(UploadError::Source(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "分片#{} 读取到 {} 字节，期望 {} 字节",
                chunk.part_number,
                data.len(),
                chunk.size()
            ),
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteErrorKind;
    use crate::uploader::mock::{MockOp, MockUploadApi};
    use crate::uploader::task::{FileInput, FileStatus};
    use parking_lot::Mutex;

    const MB: usize = 1024 * 1024;

    fn test_config() -> UploadConfig {
        UploadConfig {
            base_part_backoff_ms: 1,
            base_file_backoff_ms: 1,
            max_backoff_ms: 5,
            rate_limit_backoff_ms: 1,
            ..UploadConfig::default()
        }
    }

    fn shared_file(name: &str, size: usize) -> SharedFile {
        let input = FileInput::from_bytes(name, "image/jpeg", Bytes::from(vec![1u8; size]));
        Arc::new(Mutex::new(UploadFile::new(0, input, CancellationToken::new())))
    }

    fn task_for(file: &SharedFile, api: &Arc<MockUploadApi>, config: UploadConfig) -> ChunkedUploadTask {
        ChunkedUploadTask::new(
            file.clone(),
            "album-1".to_string(),
            api.clone(),
            Arc::new(config),
            Notifier::new(Duration::ZERO),
        )
    }

    /// 模拟 retry_failed：失败的文件回到排队状态
    fn reset_for_retry(file: &SharedFile) {
        file.lock().requeue();
    }

    #[tokio::test]
    async fn test_twelve_mb_file_in_three_parts() {
        let api = MockUploadApi::new();
        let file = shared_file("big.jpg", 12 * MB);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);

        assert_eq!(
            api.puts_for("big.jpg"),
            vec![(1, 5 * MB), (2, 5 * MB), (3, 2 * MB)]
        );
        let completed = api.completed_parts("big.jpg").unwrap();
        let numbers: Vec<u32> = completed.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let f = file.lock();
        assert_eq!(f.status(), FileStatus::Success);
        assert_eq!(f.progress, 100);
        assert_eq!(f.attempts, 0);
        assert!(f.asset_id.is_some());
        assert_eq!(api.registered_names(), vec!["big.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_byte_file_uploads_one_empty_part() {
        let api = MockUploadApi::new();
        let file = shared_file("empty.png", 0);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(api.puts_for("empty.png"), vec![(1, 0)]);
        assert_eq!(file.lock().progress, 100);
    }

    #[tokio::test]
    async fn test_part_retry_does_not_count_attempts() {
        let api = MockUploadApi::new();
        api.fail(
            MockOp::Sign(2),
            None,
            &[RemoteErrorKind::Network, RemoteErrorKind::ServerError],
        );
        let file = shared_file("retry.jpg", 12 * MB);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(api.calls(MockOp::Sign(2), None), 3);
        assert_eq!(api.calls(MockOp::Put(2), None), 1);
        assert_eq!(file.lock().attempts, 0);
    }

    #[tokio::test]
    async fn test_fatal_complete_restarts_from_init_on_retry() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Complete, None, &[RemoteErrorKind::BadRequest]);
        let file = shared_file("c.jpg", 12 * MB);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Failed { retry_after: None });
        {
            let f = file.lock();
            assert_eq!(f.status(), FileStatus::Failed);
            assert_eq!(f.attempts, 1);
            assert!(f.session.is_none());
            assert!(f.parts.is_empty());
            assert_eq!(f.last_error.as_ref().unwrap().kind, FileErrorKind::Fatal);
        }

        reset_for_retry(&file);
        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(api.calls(MockOp::Create, None), 2);
        assert_eq!(api.calls(MockOp::Put(1), None), 2);
        assert_eq!(file.lock().attempts, 1);
    }

    #[tokio::test]
    async fn test_session_expiry_restarts_once() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Sign(2), None, &[RemoteErrorKind::SessionExpired]);
        let file = shared_file("s.jpg", 12 * MB);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(api.calls(MockOp::Create, None), 2);
        // 新会话下分片 1 需要重新上传
        assert_eq!(api.calls(MockOp::Put(1), None), 2);
        assert_eq!(file.lock().attempts, 0);
    }

    #[tokio::test]
    async fn test_second_session_expiry_is_transient_failure() {
        let api = MockUploadApi::new();
        api.fail(
            MockOp::Sign(1),
            None,
            &[RemoteErrorKind::SessionExpired, RemoteErrorKind::SessionExpired],
        );
        let file = shared_file("s2.jpg", MB);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed {
                retry_after: Some(_)
            }
        ));
        let f = file.lock();
        assert_eq!(f.attempts, 1);
        assert_eq!(f.status(), FileStatus::Queued);
        assert_eq!(f.last_error.as_ref().unwrap().kind, FileErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_session_expiry_at_completing_restarts_from_init() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Complete, None, &[RemoteErrorKind::SessionExpired]);
        let file = shared_file("ce.jpg", 12 * MB);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(api.calls(MockOp::Create, None), 2);
        assert_eq!(api.calls(MockOp::Complete, None), 2);
        assert_eq!(api.calls(MockOp::Put(1), None), 2);
        assert_eq!(api.calls(MockOp::Put(3), None), 2);

        let f = file.lock();
        assert_eq!(f.attempts, 0);
        assert_eq!(f.parts.len(), 3);
        // 提交的是新会话下的完整分片列表
        let numbers: Vec<u32> = api
            .completed_parts("ce.jpg")
            .unwrap()
            .iter()
            .map(|p| p.part_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_resumed_session_expiry_restarts_from_init() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Put(2), None, &[RemoteErrorKind::Forbidden]);
        let file = shared_file("re.jpg", 12 * MB);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Failed { retry_after: None });
        {
            let f = file.lock();
            assert_eq!(f.attempts, 1);
            assert!(f.session.is_some());
            assert_eq!(f.parts.len(), 1);
        }

        // 重试复用保存的会话，但会话已在远端失效
        api.fail(MockOp::Sign(2), None, &[RemoteErrorKind::SessionExpired]);
        reset_for_retry(&file);
        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);

        assert_eq!(api.calls(MockOp::Create, None), 2);
        // 分片 1 在第一次尝试时上传过，新会话下重新上传
        assert_eq!(api.calls(MockOp::Put(1), None), 2);
        let f = file.lock();
        assert_eq!(f.attempts, 1);
        assert_eq!(f.status(), FileStatus::Success);
        assert_eq!(f.parts.len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_part_retries_escalate_to_file_retry() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Put(1), None, &[RemoteErrorKind::Timeout; 4]);
        let file = shared_file("t.jpg", MB);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed {
                retry_after: Some(_)
            }
        ));
        assert_eq!(api.calls(MockOp::Put(1), None), 4);
        {
            let f = file.lock();
            assert_eq!(f.attempts, 1);
            // 会话保留，下一次尝试不重新 INIT
            assert!(f.session.is_some());
        }

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(api.calls(MockOp::Create, None), 1);
    }

    #[tokio::test]
    async fn test_last_attempt_stays_failed() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Create, None, &[RemoteErrorKind::ServerError]);
        let file = shared_file("last.jpg", 10);
        file.lock().attempts = 2;

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Failed { retry_after: None });
        let f = file.lock();
        assert_eq!(f.attempts, 3);
        assert_eq!(f.status(), FileStatus::Failed);
    }

    #[tokio::test]
    async fn test_preview_failure_is_ignored() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Preview, None, &[RemoteErrorKind::ServerError]);
        let file = shared_file("p.jpg", 10);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert!(file.lock().last_error.is_none());
    }

    #[tokio::test]
    async fn test_registration_failure_retain_policy() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Register, None, &[RemoteErrorKind::ServerError]);
        let file = shared_file("r.jpg", 10);

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Failed { retry_after: None });
        {
            let f = file.lock();
            assert!(f.finalized);
            assert!(f.session.is_some());
            assert_eq!(
                f.last_error.as_ref().unwrap().kind,
                FileErrorKind::Registration
            );
        }

        reset_for_retry(&file);
        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        // 直接进入登记阶段
        assert_eq!(api.calls(MockOp::Create, None), 1);
        assert_eq!(api.calls(MockOp::Complete, None), 1);
        assert_eq!(api.calls(MockOp::Register, None), 2);
        assert!(api.deleted_keys().is_empty());
    }

    #[tokio::test]
    async fn test_registration_failure_delete_policy() {
        let api = MockUploadApi::new();
        api.fail(MockOp::Register, None, &[RemoteErrorKind::Forbidden]);
        let file = shared_file("d.jpg", 10);
        let config = UploadConfig {
            orphan_policy: OrphanPolicy::Delete,
            ..test_config()
        };

        let outcome = task_for(&file, &api, config.clone()).run().await;
        assert_eq!(outcome, TaskOutcome::Failed { retry_after: None });
        assert_eq!(api.deleted_keys().len(), 1);
        {
            let f = file.lock();
            assert!(!f.finalized);
            assert!(f.session.is_none());
        }

        reset_for_retry(&file);
        let outcome = task_for(&file, &api, config).run().await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(api.calls(MockOp::Create, None), 2);
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_put() {
        let api = MockUploadApi::new();
        api.set_put_delay(Duration::from_secs(30));
        let file = shared_file("slow.jpg", 10);
        let token = file.lock().cancel_token.clone();

        let handle = tokio::spawn(task_for(&file, &api, test_config()).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        file.lock().mark_cancelled();

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(token.is_cancelled());
        let f = file.lock();
        assert_eq!(f.status(), FileStatus::Cancelled);
        assert!(f.parts.is_empty());
        assert!(api.registered_names().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_file_does_not_run() {
        let api = MockUploadApi::new();
        let file = shared_file("x.jpg", 10);
        file.lock().mark_cancelled();

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(api.calls(MockOp::Create, None), 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_fatal() {
        let api = MockUploadApi::new();
        let input = FileInput {
            name: "gone.jpg".to_string(),
            size: 10,
            content_type: "image/jpeg".to_string(),
            source: FileSource::Path("/nonexistent/gone.jpg".into()),
        };
        let file = Arc::new(Mutex::new(UploadFile::new(0, input, CancellationToken::new())));

        let outcome = task_for(&file, &api, test_config()).run().await;
        assert_eq!(outcome, TaskOutcome::Failed { retry_after: None });
        assert_eq!(file.lock().last_error.as_ref().unwrap().kind, FileErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_part_timeout_is_transient() {
        let api = MockUploadApi::new();
        api.set_put_delay(Duration::from_secs(5));
        let file = shared_file("to.jpg", 10);
        let config = UploadConfig {
            part_timeout_secs: 0,
            part_max_retries: 0,
            ..test_config()
        };

        let outcome = task_for(&file, &api, config).run().await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed {
                retry_after: Some(_)
            }
        ));
        let f = file.lock();
        assert_eq!(
            f.last_error.as_ref().unwrap().remote_kind,
            Some(RemoteErrorKind::Timeout)
        );
    }
}
