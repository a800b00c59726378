//! 事件系统模块 - 同步引擎对宿主的通知
//!
//! 离线、凭证失效、同步错误等状态不再作为全局可变标记暴露，
//! 而是通过广播通道发布，宿主订阅后自行更新 UI。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::sync::{ContinuationToken, SyncMode};

/// 同步引擎事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 状态机模式变化
    ModeChanged {
        session_id: String,
        old_mode: SyncMode,
        new_mode: SyncMode,
        timestamp: i64,
    },
    /// 离线标记变化
    OfflineChanged { offline: bool, timestamp: i64 },
    /// 凭证失效标记变化（true 时宿主必须强制重新登录）
    CredentialInvalidChanged { invalid: bool, timestamp: i64 },
    /// 需要展示给用户的同步错误（bootstrap 失败等）
    SyncError { message: String, timestamp: i64 },
    /// 一个 Delta 已被消费方应用
    DeltaApplied {
        initial: bool,
        next_batch: Option<ContinuationToken>,
        room_count: usize,
        timestamp: i64,
    },
    /// 过期响应被丢弃
    StaleDiscarded {
        requested: Option<ContinuationToken>,
        timestamp: i64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ModeChanged { .. } => "mode_changed",
            SyncEvent::OfflineChanged { .. } => "offline_changed",
            SyncEvent::CredentialInvalidChanged { .. } => "credential_invalid_changed",
            SyncEvent::SyncError { .. } => "sync_error",
            SyncEvent::DeltaApplied { .. } => "delta_applied",
            SyncEvent::StaleDiscarded { .. } => "stale_discarded",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::ModeChanged { timestamp, .. }
            | SyncEvent::OfflineChanged { timestamp, .. }
            | SyncEvent::CredentialInvalidChanged { timestamp, .. }
            | SyncEvent::SyncError { timestamp, .. }
            | SyncEvent::DeltaApplied { timestamp, .. }
            | SyncEvent::StaleDiscarded { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件监听器
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
    stats: RwLock<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read();
        for key in [event.event_type(), "*"] {
            if let Some(list) = listeners.get(key) {
                for listener in list {
                    listener(&event);
                }
            }
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加回调监听器，`event_type` 为 "*" 时接收所有事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn stats(&self) -> EventStats {
        self.stats.read().clone()
    }
}
