use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("认证错误: {0}")]
    Authentication(String),

    /// 已有数据无法解析，重试不会成功
    #[error("数据损坏: {0}")]
    CorruptData(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl Error {
    /// 重试无法恢复的错误
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::CorruptData(_) | Self::InvalidArgument(_))
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
