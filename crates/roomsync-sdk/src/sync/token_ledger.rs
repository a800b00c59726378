/// 同步游标账本
///
/// 职责：
/// - 持有唯一的当前游标
/// - 只在对应 Delta 完整应用后推进游标
/// - 提供「相关性检查 + 应用 + 推进」的原子入口，防止过期响应被应用

use std::future::Future;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sync::delta::Delta;
use crate::sync::ContinuationToken;

/// 一次 accept 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// 已应用，游标已推进到 `next`（Delta 未带游标时保持不变）
    Accepted { next: Option<ContinuationToken> },
    /// 请求所用游标已被取代，响应被丢弃
    Stale {
        requested: Option<ContinuationToken>,
        current: Option<ContinuationToken>,
    },
}

/// 游标账本
#[derive(Debug, Default)]
pub struct TokenLedger {
    /// 当前游标；锁同时串行化 accept 全过程
    current: Mutex<Option<ContinuationToken>>,
}

impl TokenLedger {
    pub fn new(initial: Option<ContinuationToken>) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// 当前游标
    pub async fn current(&self) -> Option<ContinuationToken> {
        self.current.lock().await.clone()
    }

    /// 推进游标（每个已接受的 Delta 至多调用一次）
    pub async fn advance(&self, next: ContinuationToken) {
        let mut current = self.current.lock().await;
        debug!("推进同步游标: {:?} -> {}", *current, next);
        *current = Some(next);
    }

    /// 宿主显式设置游标（例如恢复持久化的值）
    pub async fn set(&self, token: Option<ContinuationToken>) {
        *self.current.lock().await = token;
    }

    /// 清空游标（登出 / 凭证失效），幂等
    pub async fn reset(&self) {
        let mut current = self.current.lock().await;
        if current.take().is_some() {
            debug!("同步游标已清空");
        }
    }

    /// 相关性判断：首个请求（空游标）或请求游标仍是当前游标
    fn is_relevant(
        requested: Option<&ContinuationToken>,
        current: Option<&ContinuationToken>,
    ) -> bool {
        match requested {
            None => true,
            Some(requested) => current == Some(requested),
        }
    }

    /// 原子地检查相关性、应用 Delta、推进游标
    ///
    /// `apply` 失败时游标不推进，错误原样返回。
    pub async fn accept<F, Fut>(
        &self,
        requested: Option<&ContinuationToken>,
        delta: Delta,
        apply: F,
    ) -> Result<AcceptOutcome>
    where
        F: FnOnce(Delta) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut current = self.current.lock().await;

        if !Self::is_relevant(requested, current.as_ref()) {
            warn!(
                "丢弃过期 sync 响应: requested={:?}, current={:?}",
                requested, *current
            );
            return Ok(AcceptOutcome::Stale {
                requested: requested.cloned(),
                current: current.clone(),
            });
        }

        let next = delta.next_batch.clone();
        apply(delta).await?;

        if let Some(next) = &next {
            *current = Some(next.clone());
        }
        Ok(AcceptOutcome::Accepted { next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn delta(next: &str) -> Delta {
        Delta {
            next_batch: Some(ContinuationToken::new(next)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn accept_advances_to_next_batch() {
        let ledger = TokenLedger::new(Some(ContinuationToken::new("a")));
        let requested = ledger.current().await;

        let outcome = ledger
            .accept(requested.as_ref(), delta("b"), |_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AcceptOutcome::Accepted { next: Some(ContinuationToken::new("b")) }
        );
        assert_eq!(ledger.current().await, Some(ContinuationToken::new("b")));
    }

    #[tokio::test]
    async fn superseded_token_is_stale_and_not_applied() {
        let ledger = TokenLedger::new(Some(ContinuationToken::new("a")));
        let applied = Arc::new(AtomicUsize::new(0));
        let old = ContinuationToken::new("a");

        ledger.advance(ContinuationToken::new("b")).await;

        let counter = applied.clone();
        let outcome = ledger
            .accept(Some(&old), delta("c"), |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(outcome, AcceptOutcome::Stale { .. }));
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.current().await, Some(ContinuationToken::new("b")));
    }

    #[tokio::test]
    async fn empty_requested_token_is_always_relevant() {
        let ledger = TokenLedger::new(Some(ContinuationToken::new("x")));
        let outcome = ledger
            .accept(None, delta("y"), |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(matches!(outcome, AcceptOutcome::Accepted { .. }));
        assert_eq!(ledger.current().await, Some(ContinuationToken::new("y")));
    }

    #[tokio::test]
    async fn failed_apply_keeps_token() {
        let ledger = TokenLedger::new(Some(ContinuationToken::new("a")));
        let requested = ledger.current().await;
        let result = ledger
            .accept(requested.as_ref(), delta("b"), |_| async {
                Err(SyncError::Consumer("disk full".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ledger.current().await, Some(ContinuationToken::new("a")));
    }

    #[tokio::test]
    async fn delta_without_next_batch_keeps_token() {
        let ledger = TokenLedger::new(Some(ContinuationToken::new("a")));
        let requested = ledger.current().await;
        let outcome = ledger
            .accept(requested.as_ref(), Delta::default(), |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, AcceptOutcome::Accepted { next: None });
        assert_eq!(ledger.current().await, Some(ContinuationToken::new("a")));
    }

    #[tokio::test]
    async fn concurrent_accept_for_same_token_applies_once() {
        use tokio_test::{assert_pending, assert_ready, task};

        let ledger = Arc::new(TokenLedger::new(Some(ContinuationToken::new("a"))));
        let old = ContinuationToken::new("a");
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first_ledger = ledger.clone();
        let first_old = old.clone();
        let mut first = task::spawn(async move {
            first_ledger
                .accept(Some(&first_old), delta("b"), |_| async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });
        assert_pending!(first.poll());

        // 第一个 apply 未完成前，同一游标的第二个响应只能等待
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        let mut second = task::spawn(ledger.accept(Some(&old), delta("c"), |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert_pending!(second.poll());

        release_tx.send(()).unwrap();
        let first_outcome = assert_ready!(first.poll()).unwrap();
        assert_eq!(
            first_outcome,
            AcceptOutcome::Accepted { next: Some(ContinuationToken::new("b")) }
        );

        let second_outcome = assert_ready!(second.poll()).unwrap();
        assert!(matches!(second_outcome, AcceptOutcome::Stale { .. }));
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.current().await, Some(ContinuationToken::new("b")));
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let ledger = TokenLedger::new(Some(ContinuationToken::new("a")));
        ledger.reset().await;
        ledger.reset().await;
        assert_eq!(ledger.current().await, None);
    }
}
