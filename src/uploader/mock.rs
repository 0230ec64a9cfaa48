// 测试用的内存上传 API
//
// 支持按操作（可选按文件名）预设失败序列、调用延迟，以及并发调用数探测

use crate::remote::{
    CompletedPart, RemoteError, RemoteErrorKind, SignedTarget, UploadApi, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 可被预设失败的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Sign(u32),
    Put(u32),
    Complete,
    Preview,
    Register,
    Delete,
}

#[derive(Debug, Clone)]
struct Target {
    name: String,
    part_number: u32,
}

#[derive(Default)]
struct MockState {
    failures: HashMap<(MockOp, Option<String>), VecDeque<RemoteErrorKind>>,
    /// object key -> 文件名
    key_names: HashMap<String, String>,
    targets: HashMap<String, Target>,
    calls: Vec<(MockOp, String)>,
    /// (文件名, 分片编号, 字节数)
    puts: Vec<(String, u32, usize)>,
    completed: Vec<(String, Vec<CompletedPart>)>,
    registered: Vec<(String, String, u64)>,
    deleted: Vec<String>,
    next_id: u64,
}

/// 内存上传 API
#[derive(Default)]
pub struct MockUploadApi {
    state: Mutex<MockState>,
    delay: Mutex<Duration>,
    put_delay: Mutex<Duration>,
    panic_on: Mutex<Option<MockOp>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a> {
    api: &'a MockUploadApi,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.api.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockUploadApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 每次调用的固定延迟
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// PUT 分片的额外延迟
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = delay;
    }

    /// 调用某操作时直接 panic
    pub fn panic_on(&self, op: MockOp) {
        *self.panic_on.lock() = Some(op);
    }

    /// 预设某操作接下来依次返回的错误
    pub fn fail(&self, op: MockOp, name: Option<&str>, kinds: &[RemoteErrorKind]) {
        self.state
            .lock()
            .failures
            .entry((op, name.map(|n| n.to_string())))
            .or_default()
            .extend(kinds.iter().copied());
    }

    /// 某操作（可选按文件名）被调用的次数
    pub fn calls(&self, op: MockOp, name: Option<&str>) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(o, n)| *o == op && name.map_or(true, |name| n == name))
            .count()
    }

    /// 某文件所有 PUT 调用的 (分片编号, 字节数)
    pub fn puts_for(&self, name: &str) -> Vec<(u32, usize)> {
        self.state
            .lock()
            .puts
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, part, len)| (*part, *len))
            .collect()
    }

    pub fn completed_parts(&self, name: &str) -> Option<Vec<CompletedPart>> {
        self.state
            .lock()
            .completed
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, parts)| parts.clone())
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.state
            .lock()
            .registered
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// 观察到的最大并发调用数
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { api: self }
    }

    fn name_for_key(&self, key: &str) -> String {
        self.state
            .lock()
            .key_names
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// 记录调用并取出预设的错误
    fn record(&self, op: MockOp, name: &str) -> Result<(), RemoteError> {
        if *self.panic_on.lock() == Some(op) {
            panic!("scripted panic in {:?}", op);
        }
        let mut state = self.state.lock();
        state.calls.push((op, name.to_string()));
        let mut scripted = state
            .failures
            .get_mut(&(op, Some(name.to_string())))
            .and_then(|q| q.pop_front());
        if scripted.is_none() {
            scripted = state
                .failures
                .get_mut(&(op, None))
                .and_then(|q| q.pop_front());
        }
        match scripted {
            Some(kind) => Err(RemoteError::new(kind, format!("scripted {:?} failure", op))),
            None => Ok(()),
        }
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl UploadApi for MockUploadApi {
    async fn create_upload_session(
        &self,
        name: &str,
        _content_type: &str,
    ) -> Result<UploadSession, RemoteError> {
        let _guard = self.enter();
        self.pause().await;
        self.record(MockOp::Create, name)?;

        let mut state = self.state.lock();
        state.next_id += 1;
        let session = UploadSession {
            upload_id: format!("upload-{}", state.next_id),
            key: format!("objects/{}-{}", state.next_id, name),
        };
        state.key_names.insert(session.key.clone(), name.to_string());
        Ok(session)
    }

    async fn sign_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
    ) -> Result<SignedTarget, RemoteError> {
        let _guard = self.enter();
        self.pause().await;
        let name = self.name_for_key(key);
        self.record(MockOp::Sign(part_number), &name)?;

        let url = format!("mock://{}/{}/{}", upload_id, key, part_number);
        self.state.lock().targets.insert(
            url.clone(),
            Target {
                name,
                part_number,
            },
        );
        Ok(SignedTarget { url })
    }

    async fn put_part(&self, target: &SignedTarget, data: Bytes) -> Result<String, RemoteError> {
        let _guard = self.enter();
        self.pause().await;
        let put_delay = *self.put_delay.lock();
        if !put_delay.is_zero() {
            tokio::time::sleep(put_delay).await;
        }

        let target = self
            .state
            .lock()
            .targets
            .get(&target.url)
            .cloned()
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::SessionExpired, "unknown target"))?;
        self.record(MockOp::Put(target.part_number), &target.name)?;

        self.state
            .lock()
            .puts
            .push((target.name.clone(), target.part_number, data.len()));
        Ok(format!(
            "\"etag-{}-{}-{}\"",
            target.name,
            target.part_number,
            data.len()
        ))
    }

    async fn complete_upload(
        &self,
        key: &str,
        _upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), RemoteError> {
        let _guard = self.enter();
        self.pause().await;
        let name = self.name_for_key(key);
        self.record(MockOp::Complete, &name)?;

        let sorted = parts.windows(2).all(|w| w[0].part_number < w[1].part_number);
        if parts.is_empty() || !sorted {
            return Err(RemoteError::new(
                RemoteErrorKind::BadRequest,
                "parts must be non-empty and strictly increasing",
            ));
        }
        self.state.lock().completed.push((name, parts.to_vec()));
        Ok(())
    }

    async fn generate_preview(&self, key: &str, _container_id: &str) -> Result<(), RemoteError> {
        let _guard = self.enter();
        self.pause().await;
        let name = self.name_for_key(key);
        self.record(MockOp::Preview, &name)
    }

    async fn register_asset(
        &self,
        key: &str,
        name: &str,
        container_id: &str,
        size: u64,
    ) -> Result<String, RemoteError> {
        let _guard = self.enter();
        self.pause().await;
        self.record(MockOp::Register, name)?;

        let mut state = self.state.lock();
        state
            .registered
            .push((name.to_string(), container_id.to_string(), size));
        Ok(format!("asset-{}", key))
    }

    async fn delete_object(&self, key: &str) -> Result<(), RemoteError> {
        let _guard = self.enter();
        self.pause().await;
        let name = self.name_for_key(key);
        self.record(MockOp::Delete, &name)?;
        self.state.lock().deleted.push(key.to_string());
        Ok(())
    }
}
