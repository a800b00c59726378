//! RoomSync SDK - 房间制即时通讯客户端的长轮询同步引擎
//!
//! 本 SDK 负责把本地状态与服务器保持一致：
//! - 🚀 首次同步（bootstrap）只拉取 state，之后进入长轮询
//! - 🧭 唯一的当前游标，过期响应直接丢弃
//! - 🔁 网络 / 服务器错误冷却后用同一游标重试，访问令牌失效时终止
//! - 💾 游标持久化（sled），重启后直接恢复
//! - 📡 同步状态与事件广播（离线、令牌失效、模式切换）
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roomsync_sdk::{RoomListStore, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .homeserver("https://matrix.example.org")
//!         .access_token("syt_xxx")
//!         .user_id("@alice:example.org")
//!         .data_dir("/path/to/data")
//!         .build();
//!
//!     let rooms = Arc::new(RoomListStore::new(config.user_id.clone()));
//!     let engine = SyncEngine::with_http(config, rooms.clone())?
//!         .with_sled_token_store()
//!         .await?;
//!
//!     // 有保存的游标则跳过 bootstrap
//!     engine.resume_from_store().await?;
//!
//!     for room in rooms.sorted_rooms() {
//!         println!("{} ({:?})", room.name.unwrap_or(room.id), room.phase);
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod http_client;
pub mod lifecycle;
pub mod room_list;
pub mod storage;
pub mod sync;
pub mod version;

pub use config::{SyncConfig, SyncConfigBuilder, SyncTimingConfig};
pub use error::{Result, SyncError};
pub use events::{EventManager, EventStats, SyncEvent};
pub use http_client::HttpSyncTransport;
pub use lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook};
pub use room_list::{RoomListStore, RoomPhase, RoomSummary, RoomType};
pub use storage::{KvStore, MemoryTokenStore, SledTokenStore, TokenStore};
pub use sync::{
    ContinuationToken, Delta, DeltaConsumer, FetchError, SyncEngine, SyncMode, SyncRequest,
    SyncStatus, SyncTransport,
};
pub use version::SDK_VERSION;
