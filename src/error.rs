/// 统一错误处理系统
///
/// 提供类型安全的错误定义、重试分类以及对外暴露的结构化错误对象

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 应用错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 配置错误（配额超出预算、未知提供商等），在任何网络调用之前失败
    #[error("[ERR_CONFIG_{0:03}] {1}")]
    Config(u16, String),

    /// Schema 中包含目标机制无法表达的结构
    #[error("[ERR_SCHEMA_UNSUPPORTED_{0:03}] {1}")]
    UnsupportedSchema(u16, String),

    /// 响应不符合请求的 Schema
    #[error("[ERR_SCHEMA_INVALID_{0:03}] {1}")]
    SchemaInvalid(u16, String),

    /// HTTP 错误，代码即状态码
    #[error("[ERR_HTTP_{0:03}] {1}")]
    Http(u16, String),

    /// 提供商限流
    #[error("[ERR_RATE_LIMIT] {message}")]
    RateLimited {
        retry_after_ms: Option<u64>,
        message: String,
    },

    /// 请求超时
    #[error("[ERR_TIMEOUT] {0}")]
    Timeout(String),

    /// 网络相关错误
    #[error("[ERR_NETWORK_{0:03}] {1}")]
    Network(u16, String),

    /// 认证/授权错误
    #[error("[ERR_AUTH_{0:03}] {1}")]
    Auth(u16, String),

    /// 提供商返回的响应结构无法识别
    #[error("[ERR_RESPONSE_{0:03}] {1}")]
    Response(u16, String),

    /// 调用方截止时间已到
    #[error("[ERR_DEADLINE] {0}")]
    Deadline(String),

    /// IO 相关错误
    #[error("[ERR_IO_{0:03}] {1}")]
    IO(u16, String),

    /// 序列化/反序列化错误
    #[error("[ERR_SERDE_{0:03}] {1}")]
    Serde(u16, String),

    /// 未知错误
    #[error("[ERR_UNKNOWN] {0}")]
    Unknown(String),
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigurationError,
    UnsupportedSchemaConstruct,
    SchemaInvalid,
    HttpError,
    RateLimited,
    Timeout,
    NetworkError,
    AuthError,
    MalformedResponse,
    DeadlineExceeded,
    IoError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::UnsupportedSchemaConstruct => "UnsupportedSchemaConstruct",
            ErrorKind::SchemaInvalid => "SchemaInvalid",
            ErrorKind::HttpError => "HttpError",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::AuthError => "AuthError",
            ErrorKind::MalformedResponse => "MalformedResponse",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::IoError => "IoError",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    /// 创建配置错误
    pub fn config(code: u16, msg: impl Into<String>) -> Self {
        Self::Config(code, msg.into())
    }

    /// 创建不支持的 Schema 结构错误
    pub fn unsupported_schema(code: u16, msg: impl Into<String>) -> Self {
        Self::UnsupportedSchema(code, msg.into())
    }

    /// 创建 Schema 校验失败错误
    pub fn schema_invalid(code: u16, msg: impl Into<String>) -> Self {
        Self::SchemaInvalid(code, msg.into())
    }

    /// 创建 HTTP 错误
    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self::Http(status, msg.into())
    }

    /// 创建限流错误
    pub fn rate_limited(retry_after: Option<Duration>, msg: impl Into<String>) -> Self {
        Self::RateLimited {
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            message: msg.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// 创建网络错误
    pub fn network(code: u16, msg: impl Into<String>) -> Self {
        Self::Network(code, msg.into())
    }

    /// 创建认证错误
    pub fn auth(code: u16, msg: impl Into<String>) -> Self {
        Self::Auth(code, msg.into())
    }

    /// 创建响应解析错误
    pub fn response(code: u16, msg: impl Into<String>) -> Self {
        Self::Response(code, msg.into())
    }

    /// 创建截止时间错误
    pub fn deadline(msg: impl Into<String>) -> Self {
        Self::Deadline(msg.into())
    }

    /// 创建 IO 错误
    pub fn io(code: u16, msg: impl Into<String>) -> Self {
        Self::IO(code, msg.into())
    }

    /// 创建序列化错误
    pub fn serde(code: u16, msg: impl Into<String>) -> Self {
        Self::Serde(code, msg.into())
    }

    /// 根据非 2xx 状态码构建错误
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        match status {
            401 => Self::auth(401, "API Key 无效或未授权"),
            403 => Self::auth(403, "访问被拒绝"),
            404 => Self::http(404, "API 端点不存在"),
            429 => Self::rate_limited(retry_after, "请求过于频繁，请稍后重试"),
            500..=599 => Self::http(status, format!("服务器错误: {}", body)),
            _ => Self::http(status, format!("HTTP 错误 {}: {}", status, body)),
        }
    }

    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(..) => ErrorKind::ConfigurationError,
            Self::UnsupportedSchema(..) => ErrorKind::UnsupportedSchemaConstruct,
            Self::SchemaInvalid(..) => ErrorKind::SchemaInvalid,
            Self::Http(..) => ErrorKind::HttpError,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Timeout(..) => ErrorKind::Timeout,
            Self::Network(..) => ErrorKind::NetworkError,
            Self::Auth(..) => ErrorKind::AuthError,
            Self::Response(..) => ErrorKind::MalformedResponse,
            Self::Deadline(..) => ErrorKind::DeadlineExceeded,
            Self::IO(..) => ErrorKind::IoError,
            Self::Serde(..) => ErrorKind::MalformedResponse,
            Self::Unknown(..) => ErrorKind::Unknown,
        }
    }

    /// 是否值得重试：超时、网络抖动、限流、5xx 以及 Schema 近似错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(..) | Self::Network(..) | Self::SchemaInvalid(..) => true,
            Self::RateLimited { .. } => true,
            Self::Http(status, _) => (500..=599).contains(status),
            _ => false,
        }
    }

    /// 提供商给出的重试等待时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// 从标准 IO 错误转换
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::io(1, "文件或目录不存在"),
            std::io::ErrorKind::PermissionDenied => Self::io(3, "权限不足"),
            std::io::ErrorKind::AlreadyExists => Self::io(2, "文件或目录已存在"),
            _ => Self::io(999, format!("IO 错误: {}", err)),
        }
    }
}

/// 从 serde_json 错误转换
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::serde(1, format!("JSON 序列化错误: {}", err))
    }
}

/// 从 serde_yaml 错误转换
impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serde(2, format!("YAML 解析错误: {}", err))
    }
}

/// 从 reqwest 错误转换
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout("请求超时")
        } else if err.is_connect() {
            Self::network(2, "网络连接失败")
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), &err.to_string(), None)
        } else {
            Self::network(999, format!("网络错误: {}", err))
        }
    }
}

/// 从 anyhow 错误转换
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown(err.to_string())
    }
}

/// 应用 Result 类型别名
pub type AppResult<T> = Result<T, AppError>;

/// 对外暴露的结构化错误对象
///
/// 调用方看到的失败永远是这一个对象，而不是原始网络异常
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("[{kind}] {message}")]
pub struct AnalysisError {
    pub kind: ErrorKind,
    pub provider_id: Option<String>,
    pub message: String,
    /// 最后一个提供商上的尝试次数
    pub attempts: u32,
}

impl AnalysisError {
    pub fn new(err: &AppError, provider_id: Option<&str>, attempts: u32) -> Self {
        Self {
            kind: err.kind(),
            provider_id: provider_id.map(str::to_string),
            message: err.to_string(),
            attempts,
        }
    }
}

impl From<AppError> for AnalysisError {
    fn from(err: AppError) -> Self {
        Self::new(&err, None, 0)
    }
}
