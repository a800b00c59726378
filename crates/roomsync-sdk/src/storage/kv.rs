//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 用户隔离的命名空间（每个用户一个 Tree）
//! - JSON 序列化的值读写
//! - 同步游标持久化（`SledTokenStore`）

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::storage::TokenStore;
use crate::sync::ContinuationToken;

/// 未配置用户时使用的命名空间
const DEFAULT_NAMESPACE: &str = "default";

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    base_path: PathBuf,
    db: Db,
    /// 当前用户的 Tree
    tree: Tree,
}

impl KvStore {
    /// 打开 `{base_path}/kv` 下的数据库，并切换到 `namespace` 对应的 Tree
    pub async fn open(base_path: &Path, namespace: &str) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个进程 / 实例可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        debug!(attempt, delay_ms, "sled 数据库被占用，稍后重试");
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            SyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree_name = format!("user_{}", namespace);
        let tree = db
            .open_tree(&tree_name)
            .map_err(|e| SyncError::KvStore(format!("打开用户 Tree 失败: {}", e)))?;
        info!("用户 KV Tree 初始化完成: {}", namespace);

        Ok(Self { base_path, db, tree })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 设置键值对
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| SyncError::Serialization(format!("序列化值失败: {}", e)))?;
        self.tree
            .insert(key, value_bytes)
            .map_err(|e| SyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self
            .tree
            .get(key)
            .map_err(|e| SyncError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| SyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对，返回是否存在过
    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let result = self
            .tree
            .remove(key)
            .map_err(|e| SyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(result.is_some())
    }

    /// 落盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// 基于 sled 的同步游标存储
///
/// 每个账号一个 key：`sync_token:{user_id}`。
#[derive(Debug, Clone)]
pub struct SledTokenStore {
    kv: KvStore,
    key: String,
}

impl SledTokenStore {
    pub async fn open(data_dir: &Path, user_id: Option<&str>) -> Result<Self> {
        let namespace = user_id.unwrap_or(DEFAULT_NAMESPACE);
        let kv = KvStore::open(data_dir, namespace).await?;
        Ok(Self {
            kv,
            key: format!("sync_token:{}", namespace),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl TokenStore for SledTokenStore {
    async fn load(&self) -> Result<Option<ContinuationToken>> {
        self.kv.get(&self.key).await
    }

    async fn save(&self, token: &ContinuationToken) -> Result<()> {
        self.kv.set(&self.key, token).await?;
        self.kv.flush().await
    }

    async fn clear(&self) -> Result<()> {
        if self.kv.delete(&self.key).await? {
            debug!("已清除持久化的同步游标: {}", self.key);
        }
        self.kv.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open(temp_dir.path(), "test_user").await.unwrap();

        let test_data = json!({ "name": "test", "value": 123 });
        store.set("test_key", &test_data).await.unwrap();
        let retrieved: serde_json::Value = store.get("test_key").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        assert!(store.delete("test_key").await.unwrap());
        assert!(!store.delete("test_key").await.unwrap());
        let deleted: Option<serde_json::Value> = store.get("test_key").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn token_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SledTokenStore::open(temp_dir.path(), Some("@alice:hs")).await.unwrap();
            assert_eq!(store.key(), "sync_token:@alice:hs");
            assert_eq!(store.load().await.unwrap(), None);
            store.save(&ContinuationToken::new("s72594_4483")).await.unwrap();
        }

        let store = SledTokenStore::open(temp_dir.path(), Some("@alice:hs")).await.unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            Some(ContinuationToken::new("s72594_4483"))
        );
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn token_store_isolates_accounts() {
        let temp_dir = TempDir::new().unwrap();
        let alice = SledTokenStore::open(temp_dir.path(), Some("@alice:hs")).await.unwrap();
        alice.save(&ContinuationToken::new("a1")).await.unwrap();
        drop(alice);

        let bob = SledTokenStore::open(temp_dir.path(), Some("@bob:hs")).await.unwrap();
        assert_eq!(bob.load().await.unwrap(), None);
    }
}
