use std::fmt;
use thiserror::Error;

/// 远程调用失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// 限流 / 吞吐量超限
    Throttling,
    /// 5xx / 服务不可用
    ServiceUnavailable,
    /// 传输层错误（超时、连接重置、拒绝连接、DNS）
    Transport,
    /// 权限、资源不存在、请求格式错误等，不重试
    Permanent,
}

impl RemoteErrorKind {
    pub fn is_transient(&self) -> bool {
        !matches!(self, RemoteErrorKind::Permanent)
    }
}

/// 一次远程调用（变更日志、对象存储、表）的失败信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// 操作名称，例如 `s3:PutObject`
    pub operation: String,
    /// 服务端错误码
    pub code: Option<String>,
    /// HTTP状态码
    pub status: Option<u16>,
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(operation: impl Into<String>, kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            code: None,
            status: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn throttled(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, RemoteErrorKind::Throttling, message).with_code("ThrottlingException")
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, RemoteErrorKind::Permanent, message)
    }

    /// 根据错误码、状态码和消息推断错误分类
    ///
    /// 适配器拿到的往往只有错误码和状态码，这里统一归类，
    /// 保证重试判定只依赖 [`RemoteErrorKind`]。
    pub fn classify(
        operation: impl Into<String>,
        code: Option<&str>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();

        let kind = match code {
            Some(
                "ThrottlingException"
                | "ProvisionedThroughputExceededException"
                | "RequestLimitExceeded"
                | "TooManyRequestsException"
                | "SlowDown"
                | "Throttling",
            ) => RemoteErrorKind::Throttling,
            Some("ServiceUnavailable" | "InternalServerError" | "InternalError" | "InternalFailure") => {
                RemoteErrorKind::ServiceUnavailable
            }
            Some("ECONNRESET" | "ETIMEDOUT" | "ENOTFOUND" | "ECONNREFUSED" | "TimeoutError" | "RequestTimeout") => {
                RemoteErrorKind::Transport
            }
            _ if status == Some(429) || lowered.contains("throttl") => RemoteErrorKind::Throttling,
            _ if matches!(status, Some(500..=599)) => RemoteErrorKind::ServiceUnavailable,
            _ if lowered.contains("timeout")
                || lowered.contains("timed out")
                || lowered.contains("network")
                || lowered.contains("connection reset")
                || lowered.contains("connection refused")
                || lowered.contains("dns") =>
            {
                RemoteErrorKind::Transport
            }
            _ => RemoteErrorKind::Permanent,
        };

        Self {
            operation: operation.into(),
            code: code.map(str::to_string),
            status,
            kind,
            message,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 失败", self.operation)?;
        if let Some(code) = &self.code {
            write!(f, " [{}]", code)?;
        }
        if let Some(status) = self.status {
            write!(f, " (HTTP {})", status)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// 单个地址（或分片）的失败记录
#[derive(Debug)]
pub struct AddressFailure {
    /// 内容地址、分片ID或批次描述
    pub address: String,
    pub error: BackupError,
}

impl fmt::Display for AddressFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.address, self.error)
    }
}

/// Stream-Backup 错误类型定义
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("配置错误: {}", .0.join("; "))]
    Configuration(Vec<String>),

    #[error("远程调用错误: {0}")]
    Remote(RemoteError),

    #[error("{operation} 重试{attempts}次后仍失败: {source}")]
    ExhaustedRetry {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<BackupError>,
    },

    #[error("无法重建地址 {address}: 只有删除标记，没有可读取的内容版本")]
    ReconciliationGap { address: String },

    #[error("地址 {address} 的内容缺少主键属性 {attribute}")]
    MissingKeyAttribute { address: String, attribute: String },

    #[error("{operation} 部分失败: {} 个失败", .failures.len())]
    Partial {
        operation: String,
        failures: Vec<AddressFailure>,
    },

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl BackupError {
    /// 默认的重试判定：只有瞬时的远程错误才值得重试
    pub fn is_retryable(&self) -> bool {
        match self {
            BackupError::Remote(remote) => remote.kind.is_transient(),
            _ => false,
        }
    }

    /// 部分失败时返回每个失败项，其它错误返回空切片
    pub fn failures(&self) -> &[AddressFailure] {
        match self {
            BackupError::Partial { failures, .. } => failures,
            _ => &[],
        }
    }
}

impl From<RemoteError> for BackupError {
    fn from(err: RemoteError) -> Self {
        BackupError::Remote(err)
    }
}

impl From<anyhow::Error> for BackupError {
    fn from(err: anyhow::Error) -> Self {
        BackupError::Unknown(err.to_string())
    }
}

/// Result类型别名
pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_throttling_codes() {
        for code in ["ThrottlingException", "ProvisionedThroughputExceededException", "RequestLimitExceeded", "SlowDown"] {
            let err = RemoteError::classify("dynamodb:Scan", Some(code), Some(400), "rate exceeded");
            assert_eq!(err.kind, RemoteErrorKind::Throttling, "{}", code);
        }

        let by_message = RemoteError::classify("s3:PutObject", None, None, "Request was Throttled");
        assert_eq!(by_message.kind, RemoteErrorKind::Throttling);
    }

    #[test]
    fn test_classify_server_and_transport_errors() {
        assert_eq!(
            RemoteError::classify("s3:GetObject", None, Some(503), "unavailable").kind,
            RemoteErrorKind::ServiceUnavailable
        );
        assert_eq!(
            RemoteError::classify("s3:GetObject", Some("InternalServerError"), None, "boom").kind,
            RemoteErrorKind::ServiceUnavailable
        );
        assert_eq!(
            RemoteError::classify("streams:GetRecords", Some("ECONNRESET"), None, "socket hang up").kind,
            RemoteErrorKind::Transport
        );
        assert_eq!(
            RemoteError::classify("streams:GetRecords", None, None, "operation timed out").kind,
            RemoteErrorKind::Transport
        );
    }

    #[test]
    fn test_classify_permanent_errors() {
        let denied = RemoteError::classify("s3:PutObject", Some("AccessDenied"), Some(403), "access denied");
        assert_eq!(denied.kind, RemoteErrorKind::Permanent);
        assert!(!BackupError::Remote(denied).is_retryable());

        let missing = RemoteError::classify("dynamodb:DescribeTable", Some("ResourceNotFoundException"), Some(400), "no table");
        assert!(!BackupError::from(missing).is_retryable());
    }

    #[test]
    fn test_configuration_error_lists_every_problem() {
        let err = BackupError::Configuration(vec!["缺少 S3_BUCKET".to_string(), "缺少 DB_TABLE".to_string()]);
        let message = err.to_string();
        assert!(message.contains("S3_BUCKET"));
        assert!(message.contains("DB_TABLE"));
        assert!(!err.is_retryable());
    }
}
