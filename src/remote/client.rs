// 基于 HTTP 的远端上传 API 实现

use crate::config::RemoteConfig;
use crate::remote::types::{
    CompleteUploadRequest, CreateSessionRequest, PreviewRequest, RegisterAssetRequest,
    RegisterAssetResponse,
};
use crate::remote::{
    CompletedPart, RemoteError, RemoteErrorKind, SignedTarget, UploadApi, UploadSession,
};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, ETAG};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info};

/// 错误日志中响应体的最大长度
const MAX_ERROR_BODY_LEN: usize = 512;

/// 远端上传 API 的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpUploadApi {
    /// 根据配置创建客户端
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(&config.user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化上传 API 客户端: base_url={}", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// 发送请求并读取响应文本，非 2xx 转换为 RemoteError
    async fn send(
        &self,
        request: RequestBuilder,
        op: &str,
        upload_scoped: bool,
    ) -> Result<String, RemoteError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        debug!("{} 响应: status={}, body={}", op, status, truncate_body(&body));

        if !status.is_success() {
            let kind = RemoteErrorKind::from_status(status.as_u16(), upload_scoped);
            error!(
                "{} 失败: status={}, kind={}, retriable={}",
                op,
                status,
                kind,
                kind.is_retriable()
            );
            return Err(RemoteError::new(
                kind,
                format!("{} 返回 {}: {}", op, status, truncate_body(&body)),
            ));
        }

        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        op: &str,
        upload_scoped: bool,
    ) -> Result<T, RemoteError> {
        let body = self.send(request, op, upload_scoped).await?;
        serde_json::from_str(&body).map_err(|e| {
            RemoteError::malformed(format!(
                "解析 {} 响应失败: {}, body={}",
                op,
                e,
                truncate_body(&body)
            ))
        })
    }
}

fn truncate_body(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY_LEN {
        return body;
    }
    let mut end = MAX_ERROR_BODY_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn create_upload_session(
        &self,
        name: &str,
        content_type: &str,
    ) -> Result<UploadSession, RemoteError> {
        info!("创建上传会话: name={}, content_type={}", name, content_type);
        let request = self
            .client
            .post(self.endpoint("uploads"))
            .json(&CreateSessionRequest {
                file_name: name,
                content_type,
            });
        let session: UploadSession = self.send_json(request, "CreateUploadSession", false).await?;
        if session.upload_id.is_empty() || session.key.is_empty() {
            return Err(RemoteError::malformed("会话响应缺少 uploadId 或 key"));
        }
        Ok(session)
    }

    async fn sign_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
    ) -> Result<SignedTarget, RemoteError> {
        let path = format!(
            "uploads/{}/parts/{}/sign",
            urlencoding::encode(upload_id),
            part_number
        );
        let request = self
            .client
            .post(self.endpoint(&path))
            .json(&json!({ "key": key }));
        self.send_json(request, "SignPart", true).await
    }

    async fn put_part(&self, target: &SignedTarget, data: Bytes) -> Result<String, RemoteError> {
        let len = data.len();
        // 签名地址自带授权，不附加 Bearer
        let response = self
            .client
            .put(&target.url)
            .body(data)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = RemoteErrorKind::from_status(status.as_u16(), true);
            return Err(RemoteError::new(
                kind,
                format!("PUT 分片返回 {}: {}", status, truncate_body(&body)),
            ));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RemoteError::malformed("PUT 分片响应缺少 ETag"))?;

        debug!("PUT 分片成功: size={}, etag={}", len, etag);
        Ok(etag)
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), RemoteError> {
        info!(
            "提交分片列表: key={}, upload_id={}, parts={}",
            key,
            upload_id,
            parts.len()
        );
        let path = format!("uploads/{}/complete", urlencoding::encode(upload_id));
        let request = self
            .client
            .post(self.endpoint(&path))
            .json(&CompleteUploadRequest {
                key,
                upload_id,
                parts,
            });
        self.send(request, "CompleteUpload", true).await?;
        Ok(())
    }

    async fn generate_preview(&self, key: &str, container_id: &str) -> Result<(), RemoteError> {
        let request = self
            .client
            .post(self.endpoint("assets/preview"))
            .json(&PreviewRequest { key, container_id });
        self.send(request, "GeneratePreview", false).await?;
        Ok(())
    }

    async fn register_asset(
        &self,
        key: &str,
        name: &str,
        container_id: &str,
        size: u64,
    ) -> Result<String, RemoteError> {
        let request = self
            .client
            .post(self.endpoint("assets"))
            .json(&RegisterAssetRequest {
                key,
                name,
                container_id,
                size,
            });
        let response: RegisterAssetResponse =
            self.send_json(request, "RegisterAsset", false).await?;
        Ok(response.asset_id)
    }

    async fn delete_object(&self, key: &str) -> Result<(), RemoteError> {
        let path = format!("objects/{}", urlencoding::encode(key));
        let request = self.client.delete(self.endpoint(&path));
        self.send(request, "DeleteObject", false).await?;
        Ok(())
    }
}
