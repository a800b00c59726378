/// 长轮询同步模块
///
/// 职责：
/// - 构造 bootstrap / live 过滤器
/// - 拉取 Delta 并分类失败
/// - 维护唯一的当前游标
/// - 驱动 bootstrap / live / backoff 状态机，丢弃过期响应

pub mod filter;
pub mod delta;
pub mod fetcher;
pub mod token_ledger;
pub mod consumer;
pub mod backoff;
pub mod session;
pub mod sync_engine;
mod bootstrap;

use serde::{Deserialize, Serialize};

pub use filter::{EventFilter, FilterBuilder, RoomFilter, SyncFilter, DEFAULT_PAGE_SIZE};
pub use delta::{BasicEvent, ClientEvent, Delta, EventList, RoomFragment, Rooms, Timeline};
pub use fetcher::{DeltaFetcher, FetchError, SyncRequest, SyncTransport};
pub use token_ledger::{AcceptOutcome, TokenLedger};
pub use consumer::DeltaConsumer;
pub use backoff::{BackoffDecision, BackoffPolicy};
pub use session::{SyncSession, SyncStats, SyncStatus, SyncStatusManager};
pub use sync_engine::SyncEngine;

/// 服务器下发的不透明游标（`next_batch`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContinuationToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for ContinuationToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// 同步状态机模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// 首次同步（只拉 state）
    Bootstrapping,
    /// 长轮询
    Live,
    /// 失败后冷却等待
    Backoff,
    /// 已停止
    Stopped,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Bootstrapping => write!(f, "bootstrapping"),
            SyncMode::Live => write!(f, "live"),
            SyncMode::Backoff => write!(f, "backoff"),
            SyncMode::Stopped => write!(f, "stopped"),
        }
    }
}
