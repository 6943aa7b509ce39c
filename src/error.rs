//! 统一错误类型
//!
//! 请求代理链路（调度、执行、渲染、存储）共用的错误定义。

use std::time::Duration;

use thiserror::Error;

/// 代理链路统一错误类型
#[derive(Debug, Error)]
pub enum RelayError {
    /// 请求者的排队数已达上限，请求未入队
    #[error("Admission rejected: requester {requester} already has {pending} pending requests")]
    AdmissionRejected { requester: i64, pending: usize },

    /// 请求者处于限制期内
    #[error("Requester {0} is restricted")]
    UserRestricted(i64),

    /// 后端网络/HTTP 错误（模型缺失除外）
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// 后端报告模型不存在，可通过 pull 恢复
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// 用户主动取消
    #[error("Cancelled")]
    Cancelled,

    /// 执行超过最大时长
    #[error("Execution timeout after {0:?}")]
    ExecutionTimeout(Duration),

    /// 聊天通道错误
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// 存储错误
    #[error("Store error: {0}")]
    Store(String),

    /// 配置错误
    #[error("Config error: {0}")]
    Config(String),
}

impl RelayError {
    /// 稳定错误码，用于日志与指标
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::AdmissionRejected { .. } => "ADMISSION_REJECTED",
            RelayError::UserRestricted(_) => "USER_RESTRICTED",
            RelayError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            RelayError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            RelayError::Cancelled => "CANCELLED",
            RelayError::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            RelayError::Channel(_) => "CHANNEL_ERROR",
            RelayError::Store(_) => "STORE_ERROR",
            RelayError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Store(format!("{:#}", e))
    }
}

impl From<r2d2::Error> for RelayError {
    fn from(e: r2d2::Error) -> Self {
        RelayError::Store(format!("connection pool: {}", e))
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(e: config::ConfigError) -> Self {
        RelayError::Config(e.to_string())
    }
}

/// Result 类型别名
pub type RelayResult<T> = Result<T, RelayError>;

/// 聊天通道（编辑/发送消息）错误
///
/// 渲染器按变体区分处理：限流重排、去格式重试、幂等成功、丢弃。
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    /// 平台返回 429
    #[error("Too many requests, retry after {retry_after:?}")]
    TooManyRequests { retry_after: Duration },

    /// 平台无法解析消息格式标记
    #[error("Can't parse entities: {0}")]
    CantParseEntities(String),

    /// 编辑内容与现有内容相同
    #[error("Message is not modified")]
    MessageNotModified,

    /// 其他错误
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        ChannelError::Other(e.to_string())
    }
}
