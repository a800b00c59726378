use thiserror::Error;

use crate::sync::FetchError;

/// SDK 错误类型
#[derive(Debug, Error)]
pub enum SyncError {
    /// 已有运行中的同步会话（重复 start）
    #[error("Sync session already running")]
    AlreadyRunning,
    /// 没有运行中的同步会话
    #[error("Sync session not running")]
    NotRunning,
    #[error("Config error: {0}")]
    Config(String),
    /// 传输层错误（已分类）
    #[error("Transport error: {0}")]
    Transport(#[from] FetchError),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("IO error: {0}")]
    IO(String),
    /// Delta 消费方处理失败
    #[error("Consumer error: {0}")]
    Consumer(String),
    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        SyncError::Transport(FetchError::Network(error.to_string()))
    }
}

impl SyncError {
    /// 是否为认证失效（需要重新登录）
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, SyncError::Transport(FetchError::AuthRejected { .. }))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
