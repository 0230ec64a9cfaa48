// 远端上传 API 的请求/响应类型与错误分类

use serde::{Deserialize, Serialize};
use std::fmt;

/// 分片上传会话（CreateUploadSession 返回）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// 会话 ID，关联同一文件的所有分片
    pub upload_id: String,
    /// 对象存储中的 key
    pub key: String,
}

/// 签名上传目标（SignPart 返回）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTarget {
    /// 预授权的 PUT 地址，有时效
    #[serde(alias = "signedUrl")]
    pub url: String,
}

/// 已确认的分片（CompleteUpload 的入参）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionRequest<'a> {
    pub file_name: &'a str,
    pub content_type: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompleteUploadRequest<'a> {
    pub key: &'a str,
    pub upload_id: &'a str,
    pub parts: &'a [CompletedPart],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PreviewRequest<'a> {
    pub key: &'a str,
    pub container_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterAssetRequest<'a> {
    pub key: &'a str,
    pub name: &'a str,
    pub container_id: &'a str,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterAssetResponse {
    #[serde(alias = "id")]
    pub asset_id: String,
}

/// 远端错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 分片会话已过期，需要从 INIT 重新开始
    SessionExpired,
    /// 资源不存在（不可重试）
    NotFound,
    /// 权限不足（不可重试）
    Forbidden,
    /// 参数错误（不可重试）
    BadRequest,
    /// 响应格式错误（不可重试）
    MalformedResponse,
    /// 未知错误
    Unknown,
}

impl RemoteErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RemoteErrorKind::Network
                | RemoteErrorKind::Timeout
                | RemoteErrorKind::ServerError
                | RemoteErrorKind::RateLimited
        )
    }

    /// 从 HTTP 状态码转换
    ///
    /// `upload_scoped` 表示请求路径绑定了某个 upload_id，此时 404/410 视为会话过期
    pub fn from_status(status: u16, upload_scoped: bool) -> Self {
        match status {
            408 => RemoteErrorKind::Timeout,
            429 => RemoteErrorKind::RateLimited,
            404 | 410 if upload_scoped => RemoteErrorKind::SessionExpired,
            404 | 410 => RemoteErrorKind::NotFound,
            401 | 403 => RemoteErrorKind::Forbidden,
            400..=499 => RemoteErrorKind::BadRequest,
            500..=599 => RemoteErrorKind::ServerError,
            _ => RemoteErrorKind::Unknown,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::Network => "network",
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::ServerError => "server_error",
            RemoteErrorKind::RateLimited => "rate_limited",
            RemoteErrorKind::SessionExpired => "session_expired",
            RemoteErrorKind::NotFound => "not_found",
            RemoteErrorKind::Forbidden => "forbidden",
            RemoteErrorKind::BadRequest => "bad_request",
            RemoteErrorKind::MalformedResponse => "malformed_response",
            RemoteErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// 远端调用错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::MalformedResponse, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    pub fn is_session_expired(&self) -> bool {
        self.kind == RemoteErrorKind::SessionExpired
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            RemoteErrorKind::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            RemoteErrorKind::Network
        } else if e.is_decode() {
            RemoteErrorKind::MalformedResponse
        } else if let Some(status) = e.status() {
            RemoteErrorKind::from_status(status.as_u16(), false)
        } else {
            RemoteErrorKind::Unknown
        };
        RemoteError::new(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_retriable() {
        assert!(RemoteErrorKind::Network.is_retriable());
        assert!(RemoteErrorKind::Timeout.is_retriable());
        assert!(RemoteErrorKind::ServerError.is_retriable());
        assert!(RemoteErrorKind::RateLimited.is_retriable());

        assert!(!RemoteErrorKind::SessionExpired.is_retriable());
        assert!(!RemoteErrorKind::Forbidden.is_retriable());
        assert!(!RemoteErrorKind::BadRequest.is_retriable());
        assert!(!RemoteErrorKind::MalformedResponse.is_retriable());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(RemoteErrorKind::from_status(503, false), RemoteErrorKind::ServerError);
        assert_eq!(RemoteErrorKind::from_status(429, true), RemoteErrorKind::RateLimited);
        assert_eq!(RemoteErrorKind::from_status(408, false), RemoteErrorKind::Timeout);
        assert_eq!(RemoteErrorKind::from_status(404, true), RemoteErrorKind::SessionExpired);
        assert_eq!(RemoteErrorKind::from_status(410, true), RemoteErrorKind::SessionExpired);
        assert_eq!(RemoteErrorKind::from_status(404, false), RemoteErrorKind::NotFound);
        assert_eq!(RemoteErrorKind::from_status(403, true), RemoteErrorKind::Forbidden);
        assert_eq!(RemoteErrorKind::from_status(422, false), RemoteErrorKind::BadRequest);
    }

    #[test]
    fn test_completed_part_wire_format() {
        let part = CompletedPart {
            part_number: 2,
            etag: "\"abc\"".to_string(),
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["partNumber"], 2);
        assert_eq!(json["ETag"], "\"abc\"");
    }
}
