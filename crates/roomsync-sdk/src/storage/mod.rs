//! 存储模块 - 同步游标持久化
//!
//! 引擎每次推进游标后调用 `TokenStore::save`，宿主重启时用 `load` 的结果恢复同步。

pub mod kv;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::sync::ContinuationToken;

pub use kv::{KvStore, SledTokenStore};

/// 游标存储接口
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<ContinuationToken>>;

    async fn save(&self, token: &ContinuationToken) -> Result<()>;

    /// 幂等
    async fn clear(&self) -> Result<()>;
}

/// 进程内游标存储（测试，或宿主自行持久化时使用）
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<ContinuationToken>>,
}

impl MemoryTokenStore {
    pub fn new(initial: Option<ContinuationToken>) -> Self {
        Self {
            token: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<ContinuationToken>> {
        Ok(self.token.read().clone())
    }

    async fn save(&self, token: &ContinuationToken) -> Result<()> {
        *self.token.write() = Some(token.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.token.write() = None;
        Ok(())
    }
}
