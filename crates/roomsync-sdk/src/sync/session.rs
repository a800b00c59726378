//! 同步会话与状态管理
//!
//! 提供宿主可观察的同步状态：
//! - 状态机模式与在途请求
//! - 离线 / 凭证失效 / 同步完成标记
//! - 统计信息
//!
//! 标记变化通过 `EventManager` 广播，只有当前绑定的会话可以写入状态，
//! 已被取代但仍在排空的旧会话的写入会被忽略。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{EventManager, SyncEvent};
use crate::sync::{ContinuationToken, SyncMode};

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 一次 `start()` 对应的会话
#[derive(Debug)]
pub struct SyncSession {
    id: String,
    stopped: AtomicBool,
    started_at: i64,
}

impl SyncSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stopped: AtomicBool::new(false),
            started_at: now_millis(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// 标记停止，返回此前是否仍在运行
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}

/// 在途请求标识
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightRequest {
    pub request_id: u64,
    pub since: Option<ContinuationToken>,
}

/// 同步统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    /// 已应用的 Delta 数（含 bootstrap）
    pub deltas_applied: u64,
    /// 被丢弃的过期响应数
    pub stale_discarded: u64,
    /// 失败请求总数
    pub failed_requests: u64,
    /// 当前连续失败次数
    pub consecutive_failures: u32,
    /// 最后一次成功时间（UTC毫秒时间戳）
    pub last_success_at: Option<i64>,
    /// 最后一次失败时间（UTC毫秒时间戳）
    pub last_failure_at: Option<i64>,
    pub last_error: Option<String>,
}

/// 同步状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    /// 当前（或最近一次）会话 ID
    pub session_id: Option<String>,
    pub mode: SyncMode,
    /// 最近一次请求失败且尚未成功恢复
    pub offline: bool,
    /// 服务器拒绝凭证；粘滞，直到新的 start()
    pub credential_invalid: bool,
    /// 最近一次 Delta 已完整应用
    pub sync_complete: bool,
    pub in_flight: Option<InFlightRequest>,
    /// 会话开始时间（UTC毫秒时间戳）
    pub started_at: Option<i64>,
    pub stats: SyncStats,
    pub sdk_version: String,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self {
            session_id: None,
            mode: SyncMode::Stopped,
            offline: false,
            credential_invalid: false,
            sync_complete: false,
            in_flight: None,
            started_at: None,
            stats: SyncStats::default(),
            sdk_version: crate::version::SDK_VERSION.to_string(),
        }
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        let in_flight = self
            .in_flight
            .as_ref()
            .map(|r| {
                format!(
                    "#{} since={}",
                    r.request_id,
                    r.since.as_ref().map(|t| t.as_str()).unwrap_or("<none>")
                )
            })
            .unwrap_or_else(|| "无".to_string());

        format!(
            "【同步状态】\n\
             会话: {}\n\
             模式: {}\n\
             离线: {}\n\
             凭证失效: {}\n\
             同步完成: {}\n\
             在途请求: {}\n\
             统计: 应用{}个/丢弃{}个/失败{}次\n\
             SDK版本: {}",
            self.session_id.as_deref().unwrap_or("<none>"),
            self.mode,
            self.offline,
            self.credential_invalid,
            self.sync_complete,
            in_flight,
            self.stats.deltas_applied,
            self.stats.stale_discarded,
            self.stats.failed_requests,
            self.sdk_version
        )
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// 同步状态管理器（线程安全）
pub struct SyncStatusManager {
    state: RwLock<SyncStatus>,
    events: Arc<EventManager>,
}

impl SyncStatusManager {
    pub fn new(events: Arc<EventManager>) -> Self {
        Self {
            state: RwLock::new(SyncStatus::new()),
            events,
        }
    }

    /// 在写锁内修改状态，锁释放后再发布事件（监听器可以安全地读取快照）
    fn update<F>(&self, session_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SyncStatus, &mut Vec<SyncEvent>),
    {
        let mut pending = Vec::new();
        {
            let mut state = self.state.write();
            if state.session_id.as_deref() != Some(session_id) {
                debug!(session_id, "会话已被取代，忽略状态更新");
                return false;
            }
            f(&mut state, &mut pending);
        }
        for event in pending {
            self.events.emit(event);
        }
        true
    }

    /// 绑定新会话；清除凭证失效标记
    pub fn begin_session(&self, session: &SyncSession, mode: SyncMode) {
        let mut pending = Vec::new();
        {
            let mut state = self.state.write();
            let old_mode = state.mode;
            state.session_id = Some(session.id().to_string());
            state.started_at = Some(session.started_at());
            state.mode = mode;
            state.in_flight = None;
            state.stats.consecutive_failures = 0;
            if state.credential_invalid {
                state.credential_invalid = false;
                pending.push(SyncEvent::CredentialInvalidChanged {
                    invalid: false,
                    timestamp: now_millis(),
                });
            }
            pending.push(SyncEvent::ModeChanged {
                session_id: session.id().to_string(),
                old_mode,
                new_mode: mode,
                timestamp: now_millis(),
            });
        }
        for event in pending {
            self.events.emit(event);
        }
    }

    pub fn is_current(&self, session_id: &str) -> bool {
        self.state.read().session_id.as_deref() == Some(session_id)
    }

    pub fn set_mode(&self, session_id: &str, mode: SyncMode) {
        self.update(session_id, |state, pending| {
            if state.mode != mode {
                let old_mode = state.mode;
                state.mode = mode;
                pending.push(SyncEvent::ModeChanged {
                    session_id: session_id.to_string(),
                    old_mode,
                    new_mode: mode,
                    timestamp: now_millis(),
                });
            }
        });
    }

    pub fn set_offline(&self, session_id: &str, offline: bool) {
        self.update(session_id, |state, pending| {
            if state.offline != offline {
                state.offline = offline;
                pending.push(SyncEvent::OfflineChanged {
                    offline,
                    timestamp: now_millis(),
                });
            }
        });
    }

    pub fn set_credential_invalid(&self, session_id: &str, invalid: bool) {
        self.update(session_id, |state, pending| {
            if state.credential_invalid != invalid {
                state.credential_invalid = invalid;
                pending.push(SyncEvent::CredentialInvalidChanged {
                    invalid,
                    timestamp: now_millis(),
                });
            }
        });
    }

    pub fn set_sync_complete(&self, session_id: &str, complete: bool) {
        self.update(session_id, |state, _| state.sync_complete = complete);
    }

    pub fn set_in_flight(&self, session_id: &str, request: Option<InFlightRequest>) {
        self.update(session_id, |state, _| state.in_flight = request);
    }

    /// Delta 已应用
    pub fn record_applied(
        &self,
        session_id: &str,
        initial: bool,
        next_batch: Option<ContinuationToken>,
        room_count: usize,
    ) {
        self.update(session_id, |state, pending| {
            let now = now_millis();
            state.stats.deltas_applied += 1;
            state.stats.consecutive_failures = 0;
            state.stats.last_success_at = Some(now);
            pending.push(SyncEvent::DeltaApplied {
                initial,
                next_batch,
                room_count,
                timestamp: now,
            });
        });
    }

    /// 过期响应被丢弃
    pub fn record_stale(&self, session_id: &str, requested: Option<ContinuationToken>) {
        self.update(session_id, |state, pending| {
            state.stats.stale_discarded += 1;
            pending.push(SyncEvent::StaleDiscarded {
                requested,
                timestamp: now_millis(),
            });
        });
    }

    /// 请求或应用失败
    pub fn record_failure(&self, session_id: &str, message: &str) {
        self.update(session_id, |state, _| {
            state.stats.failed_requests += 1;
            state.stats.consecutive_failures = state.stats.consecutive_failures.saturating_add(1);
            state.stats.last_failure_at = Some(now_millis());
            state.stats.last_error = Some(message.to_string());
        });
    }

    /// 向宿主报告需要展示的同步错误
    pub fn report_error(&self, session_id: &str, message: &str) {
        self.update(session_id, |_, pending| {
            pending.push(SyncEvent::SyncError {
                message: message.to_string(),
                timestamp: now_millis(),
            });
        });
    }

    /// 会话结束
    pub fn end_session(&self, session_id: &str) {
        self.update(session_id, |state, pending| {
            state.in_flight = None;
            if state.mode != SyncMode::Stopped {
                let old_mode = state.mode;
                state.mode = SyncMode::Stopped;
                pending.push(SyncEvent::ModeChanged {
                    session_id: session_id.to_string(),
                    old_mode,
                    new_mode: SyncMode::Stopped,
                    timestamp: now_millis(),
                });
            }
        });
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.state.read().clone()
    }

    pub fn is_credential_invalid(&self) -> bool {
        self.state.read().credential_invalid
    }

    /// 打印状态到日志
    pub fn log_state(&self) {
        info!("\n{}", self.state.read().summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<EventManager>, SyncStatusManager) {
        let events = Arc::new(EventManager::new(64));
        (events.clone(), SyncStatusManager::new(events))
    }

    #[test]
    fn session_stop_reports_first_transition_only() {
        let session = SyncSession::new();
        assert!(!session.is_stopped());
        assert!(session.stop());
        assert!(!session.stop());
        assert!(session.is_stopped());
    }

    #[tokio::test]
    async fn flags_emit_only_on_change() {
        let (events, status) = manager();
        let mut rx = events.subscribe();
        let session = SyncSession::new();
        status.begin_session(&session, SyncMode::Live);

        status.set_offline(session.id(), true);
        status.set_offline(session.id(), true);
        status.set_offline(session.id(), false);

        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::ModeChanged { new_mode: SyncMode::Live, .. }));
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::OfflineChanged { offline: true, .. }));
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::OfflineChanged { offline: false, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn superseded_session_cannot_write() {
        let (_, status) = manager();
        let old = SyncSession::new();
        let new = SyncSession::new();
        status.begin_session(&old, SyncMode::Backoff);
        status.begin_session(&new, SyncMode::Live);

        status.set_offline(old.id(), true);
        status.end_session(old.id());

        let snapshot = status.snapshot();
        assert!(!snapshot.offline);
        assert_eq!(snapshot.mode, SyncMode::Live);
        assert_eq!(snapshot.session_id.as_deref(), Some(new.id()));
    }

    #[test]
    fn new_session_clears_credential_invalid() {
        let (_, status) = manager();
        let first = SyncSession::new();
        status.begin_session(&first, SyncMode::Live);
        status.set_credential_invalid(first.id(), true);
        assert!(status.is_credential_invalid());

        let second = SyncSession::new();
        status.begin_session(&second, SyncMode::Bootstrapping);
        assert!(!status.is_credential_invalid());
    }

    #[test]
    fn sync_complete_is_written_by_current_session_only() {
        let (_, status) = manager();
        let old = SyncSession::new();
        status.begin_session(&old, SyncMode::Live);
        status.set_sync_complete(old.id(), true);
        assert!(status.snapshot().sync_complete);

        let new = SyncSession::new();
        status.begin_session(&new, SyncMode::Live);
        status.set_sync_complete(old.id(), false);
        assert!(status.snapshot().sync_complete);

        status.set_sync_complete(new.id(), false);
        assert!(!status.snapshot().sync_complete);
    }

    #[test]
    fn stats_track_success_and_failure() {
        let (_, status) = manager();
        let session = SyncSession::new();
        status.begin_session(&session, SyncMode::Live);

        status.record_failure(session.id(), "network error: down");
        status.record_failure(session.id(), "network error: down");
        assert_eq!(status.snapshot().stats.consecutive_failures, 2);

        status.record_applied(session.id(), false, Some(ContinuationToken::new("t1")), 3);
        status.record_stale(session.id(), Some(ContinuationToken::new("t0")));

        let snapshot = status.snapshot();
        assert_eq!(snapshot.stats.failed_requests, 2);
        assert_eq!(snapshot.stats.consecutive_failures, 0);
        assert_eq!(snapshot.stats.deltas_applied, 1);
        assert_eq!(snapshot.stats.stale_discarded, 1);
        assert!(snapshot.summary().contains("应用1个"));
        assert!(snapshot.to_json_pretty().unwrap().contains("\"deltas_applied\": 1"));
    }
}
