//! 启动同步（Bootstrap）
//!
//! 没有可恢复的游标时，先用只含 state 的过滤器做一次 `full_state` 同步，
//! 由消费方整体构建房间列表，再进入长轮询。
//!
//! 失败不重试：向宿主报告错误后会话结束，是否重新 start 由宿主决定。

use tracing::{error, info, warn};

use super::sync_engine::SessionContext;
use super::{AcceptOutcome, ContinuationToken, SyncMode};

/// Bootstrap 结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum BootstrapOutcome {
    /// 初始状态已应用，游标已推进
    Completed { next: Option<ContinuationToken> },
    /// 请求或应用失败，会话应结束
    Failed,
    /// 会话已停止 / 被取消，结果未应用
    Stopped,
}

impl SessionContext {
    pub(super) async fn run_bootstrap(&self) -> BootstrapOutcome {
        let sid = self.session.id();
        let filter = self.filters.bootstrap_filter();
        let request = self
            .fetcher
            .prepare(None, &filter, self.timing.bootstrap_timeout_ms, true);
        info!(session_id = sid, request_id = request.request_id, "🔄 开始初始同步");

        self.track_in_flight(&request);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return BootstrapOutcome::Stopped,
            result = self.fetcher.execute(&request) => result,
        };
        self.status.set_in_flight(sid, None);

        let delta = match result {
            Ok(delta) => delta,
            Err(e) => {
                error!(session_id = sid, error = %e, "初始同步请求失败");
                self.status.record_failure(sid, &e.to_string());
                if e.is_auth_rejected() {
                    self.status.set_credential_invalid(sid, true);
                }
                self.status.report_error(sid, &format!("初始同步失败: {}", e));
                self.mark_sync_complete(false).await;
                return BootstrapOutcome::Failed;
            }
        };

        if self.session.is_stopped() {
            info!(session_id = sid, "会话已停止，丢弃初始同步结果");
            return BootstrapOutcome::Stopped;
        }

        let room_count = delta.room_count();
        let consumer = self.consumer.clone();
        let outcome = self
            .ledger
            .accept(None, delta, move |delta| async move {
                consumer.apply_initial(delta).await
            })
            .await;

        match outcome {
            Ok(AcceptOutcome::Accepted { next }) => {
                self.mark_sync_complete(true).await;
                self.status.record_applied(sid, true, next.clone(), room_count);
                if let Some(next) = &next {
                    self.persist_token(next).await;
                } else {
                    warn!(session_id = sid, "初始同步响应缺少 next_batch");
                }
                self.status.set_mode(sid, SyncMode::Live);
                info!(session_id = sid, rooms = room_count, "✅ 初始同步完成");
                BootstrapOutcome::Completed { next }
            }
            // 空请求游标总是相关的
            Ok(AcceptOutcome::Stale { .. }) => BootstrapOutcome::Failed,
            Err(e) => {
                error!(session_id = sid, error = %e, "初始同步结果应用失败");
                self.status.record_failure(sid, &e.to_string());
                self.status.report_error(sid, &format!("初始同步失败: {}", e));
                self.mark_sync_complete(false).await;
                BootstrapOutcome::Failed
            }
        }
    }
}
