// 远端上传 API 模块
//
// 后端负责会话创建、URL 签名、对象定稿、缩略图生成与资产登记，
// 这里只定义调用契约和一个基于 HTTP 的实现。

pub mod client;
pub mod types;

pub use client::HttpUploadApi;
pub use types::*;

use async_trait::async_trait;
use bytes::Bytes;

/// 分片上传协议契约
///
/// 所有方法都是挂起点；实现必须可在多个任务间共享（`Send + Sync`）。
#[async_trait]
pub trait UploadApi: Send + Sync + 'static {
    /// 创建分片上传会话
    async fn create_upload_session(
        &self,
        name: &str,
        content_type: &str,
    ) -> Result<UploadSession, RemoteError>;

    /// 为 `(upload_id, part_number)` 获取签名上传目标
    async fn sign_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
    ) -> Result<SignedTarget, RemoteError>;

    /// 将一个分片 PUT 到签名目标，返回 ETag
    async fn put_part(&self, target: &SignedTarget, data: Bytes) -> Result<String, RemoteError>;

    /// 提交完整的分片列表，定稿远端对象
    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), RemoteError>;

    /// 触发派生资源（预览图）生成，尽力而为
    async fn generate_preview(&self, key: &str, container_id: &str) -> Result<(), RemoteError>;

    /// 将定稿对象登记为资产记录，返回资产 ID
    async fn register_asset(
        &self,
        key: &str,
        name: &str,
        container_id: &str,
        size: u64,
    ) -> Result<String, RemoteError>;

    /// 删除远端对象（仅孤儿对象清理使用）
    async fn delete_object(&self, key: &str) -> Result<(), RemoteError>;
}
