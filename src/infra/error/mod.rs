//! 错误处理模块
//!
//! 去重协议的判定结果（重复、稍后重试）不走错误通道，见 `core::dedup`。
//! 这里只保留需要向上传播的错误，以及管道边界上使用的 `RetryLater`。

/// 错误类型
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    /// 前置条件暂未满足，消息需要稍后重新投递（非毒消息）
    #[error("稍后重试: {0}")]
    RetryLater(String),

    /// 去重链路上的协议错误（头部缺失、格式错误、链路状态行丢失），不可重试
    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("传输错误: {0}")]
    Transport(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("IO 错误: {0}")]
    Io(String),

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl Error {
    /// 是否为暂时性错误
    ///
    /// 传输层据此决定重新投递还是转入死信
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RetryLater(_) | Error::Database(_) | Error::Transport(_) | Error::Io(_)
        )
    }
}

/// 结果类型
pub type Result<T> = std::result::Result<T, Error>;

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Self::Unknown(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Unknown(s)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
