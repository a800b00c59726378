/// 同步引擎
///
/// 职责：
/// - 管理同步会话的启动 / 停止 / 关闭
/// - 驱动 bootstrap → live ⇄ backoff 状态机（每个会话一个 tokio 任务，严格串行）
/// - 通过游标账本丢弃过期响应，保证 Delta 按序、至多一次地交给消费方
/// - 持久化游标，向宿主发布状态事件

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{SyncConfig, SyncTimingConfig};
use crate::error::{Result, SyncError};
use crate::events::{EventManager, SyncEvent};
use crate::http_client::HttpSyncTransport;
use crate::storage::{SledTokenStore, TokenStore};
use crate::sync::backoff::{BackoffDecision, BackoffPolicy};
use crate::sync::bootstrap::BootstrapOutcome;
use crate::sync::consumer::DeltaConsumer;
use crate::sync::delta::Delta;
use crate::sync::fetcher::{DeltaFetcher, SyncRequest, SyncTransport};
use crate::sync::filter::FilterBuilder;
use crate::sync::session::{InFlightRequest, SyncSession, SyncStatus, SyncStatusManager};
use crate::sync::token_ledger::{AcceptOutcome, TokenLedger};
use crate::sync::{ContinuationToken, SyncMode};

/// 单个会话任务持有的上下文
pub(super) struct SessionContext {
    pub(super) session: Arc<SyncSession>,
    pub(super) fetcher: DeltaFetcher,
    pub(super) filters: FilterBuilder,
    pub(super) ledger: Arc<TokenLedger>,
    pub(super) consumer: Arc<dyn DeltaConsumer>,
    pub(super) status: Arc<SyncStatusManager>,
    pub(super) token_store: Option<Arc<dyn TokenStore>>,
    pub(super) timing: SyncTimingConfig,
    pub(super) max_server_error_retries: Option<u32>,
    pub(super) cancel: CancellationToken,
}

impl SessionContext {
    pub(super) fn track_in_flight(&self, request: &SyncRequest) {
        self.status.set_in_flight(
            self.session.id(),
            Some(InFlightRequest {
                request_id: request.request_id,
                since: request.since.clone(),
            }),
        );
    }

    /// 同步完成标记的唯一写入口：状态快照与消费方同时更新，只有当前会话可写
    pub(super) async fn mark_sync_complete(&self, complete: bool) {
        if self.status.is_current(self.session.id()) {
            self.status.set_sync_complete(self.session.id(), complete);
            self.consumer.set_sync_complete(complete).await;
        }
    }

    pub(super) async fn persist_token(&self, token: &ContinuationToken) {
        if let Some(store) = &self.token_store {
            if let Err(e) = store.save(token).await {
                warn!(session_id = self.session.id(), error = %e, "持久化同步游标失败");
            }
        }
    }

    async fn run(self, bootstrap: bool) {
        info!(session_id = self.session.id(), bootstrap, "同步会话开始");
        if bootstrap {
            match self.run_bootstrap().await {
                BootstrapOutcome::Completed { next } => {
                    debug!(session_id = self.session.id(), next_batch = ?next, "进入长轮询");
                    self.run_live().await
                }
                BootstrapOutcome::Failed | BootstrapOutcome::Stopped => {}
            }
        } else {
            self.run_live().await;
        }
        self.session.stop();
        self.status.end_session(self.session.id());
        info!(session_id = self.session.id(), "同步会话结束");
    }

    async fn run_live(&self) {
        let sid = self.session.id();
        let filter = self.filters.live_filter();
        let mut policy = BackoffPolicy::from_timing(&self.timing, self.max_server_error_retries);
        let mut offline = false;
        // 每个会话的第一个 live 请求使用短超时
        let mut caught_up = false;

        loop {
            if self.session.is_stopped() && !offline {
                debug!(session_id = sid, "会话已停止，退出同步循环");
                break;
            }

            let token = self.ledger.current().await;
            let timeout_ms = if caught_up {
                self.timing.long_poll_timeout_ms
            } else {
                self.timing.catch_up_timeout_ms
            };
            let request = self.fetcher.prepare(token.as_ref(), &filter, timeout_ms, false);
            self.track_in_flight(&request);

            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.fetcher.execute(&request) => result,
            };
            self.status.set_in_flight(sid, None);

            let delay = match result {
                Ok(delta) => {
                    if offline {
                        info!(session_id = sid, "🌐 网络已恢复");
                        offline = false;
                    }
                    self.status.set_offline(sid, false);
                    policy.reset();

                    if self.session.is_stopped() {
                        info!(
                            session_id = sid,
                            request_id = request.request_id,
                            "会话已停止，丢弃迟到的响应"
                        );
                        break;
                    }

                    match self.accept_incremental(&request, delta).await {
                        Ok(()) => {
                            caught_up = true;
                            continue;
                        }
                        Err(e) => {
                            warn!(
                                session_id = sid,
                                request_id = request.request_id,
                                error = %e,
                                "Delta 应用失败，冷却后用同一游标重试"
                            );
                            self.status.record_failure(sid, &e.to_string());
                            self.mark_sync_complete(false).await;
                            policy.delay()
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        session_id = sid,
                        request_id = request.request_id,
                        error = %e,
                        "sync 请求失败"
                    );
                    offline = true;
                    self.status.set_offline(sid, true);
                    self.status.record_failure(sid, &e.to_string());
                    self.mark_sync_complete(false).await;

                    match policy.on_fetch_error(&e) {
                        BackoffDecision::Retry(delay) => delay,
                        BackoffDecision::CredentialInvalid => {
                            error!(session_id = sid, error = %e, "访问令牌失效，同步终止");
                            self.status.set_credential_invalid(sid, true);
                            break;
                        }
                        BackoffDecision::GiveUp { attempts } => {
                            error!(session_id = sid, attempts, "服务器连续出错，同步终止");
                            self.status.report_error(
                                sid,
                                &format!("服务器连续 {} 次返回错误: {}", attempts, e),
                            );
                            break;
                        }
                    }
                }
            };

            self.status.set_mode(sid, SyncMode::Backoff);
            debug!(session_id = sid, delay_ms = delay.as_millis() as u64, "进入冷却");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.status.set_mode(sid, SyncMode::Live);
        }
    }

    /// 相关性检查 + 应用 + 推进游标
    async fn accept_incremental(&self, request: &SyncRequest, delta: Delta) -> Result<()> {
        let sid = self.session.id();
        let room_count = delta.room_count();
        let consumer = self.consumer.clone();
        let outcome = self
            .ledger
            .accept(request.since.as_ref(), delta, move |delta| async move {
                consumer.apply_incremental(delta).await
            })
            .await?;

        match outcome {
            AcceptOutcome::Accepted { next } => {
                self.mark_sync_complete(true).await;
                self.status.record_applied(sid, false, next.clone(), room_count);
                if let Some(next) = &next {
                    self.persist_token(next).await;
                }
                debug!(
                    session_id = sid,
                    request_id = request.request_id,
                    next_batch = ?next,
                    rooms = room_count,
                    "Delta 已应用"
                );
            }
            AcceptOutcome::Stale { requested, current } => {
                info!(
                    session_id = sid,
                    request_id = request.request_id,
                    requested = ?requested,
                    current = ?current,
                    "游标已被取代，丢弃过期响应"
                );
                self.status.record_stale(sid, requested);
            }
        }
        Ok(())
    }
}

struct RunningSession {
    session: Arc<SyncSession>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningSession {
    fn is_live(&self) -> bool {
        !self.session.is_stopped() && !self.task.is_finished()
    }
}

/// 同步引擎
pub struct SyncEngine {
    config: SyncConfig,
    fetcher: DeltaFetcher,
    filters: FilterBuilder,
    ledger: Arc<TokenLedger>,
    consumer: Arc<dyn DeltaConsumer>,
    events: Arc<EventManager>,
    status: Arc<SyncStatusManager>,
    token_store: Option<Arc<dyn TokenStore>>,
    /// 串行化 start / shutdown
    start_lock: AsyncMutex<()>,
    running: Mutex<Option<RunningSession>>,
    /// 已停止但仍在离线重试中的旧会话
    draining: Mutex<Vec<RunningSession>>,
}

impl SyncEngine {
    /// 创建同步引擎
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn SyncTransport>,
        consumer: Arc<dyn DeltaConsumer>,
    ) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        let status = Arc::new(SyncStatusManager::new(events.clone()));
        Ok(Self {
            fetcher: DeltaFetcher::new(transport),
            filters: FilterBuilder::new(config.page_size),
            ledger: Arc::new(TokenLedger::default()),
            consumer,
            events,
            status,
            token_store: None,
            start_lock: AsyncMutex::new(()),
            running: Mutex::new(None),
            draining: Mutex::new(Vec::new()),
            config,
        })
    }

    /// 使用 HTTP 传输创建同步引擎
    pub fn with_http(config: SyncConfig, consumer: Arc<dyn DeltaConsumer>) -> Result<Self> {
        config.validate_for_http()?;
        let transport = Arc::new(HttpSyncTransport::new(&config)?);
        Self::new(config, transport, consumer)
    }

    /// 挂载游标存储，每次推进后保存
    pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    /// 在 `data_dir` 下打开 sled 游标存储并挂载
    pub async fn with_sled_token_store(self) -> Result<Self> {
        let store =
            SledTokenStore::open(&self.config.data_dir, self.config.user_id.as_deref()).await?;
        Ok(self.with_token_store(Arc::new(store)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 启动同步会话
    ///
    /// `saved` 存在时从该游标恢复长轮询；否则先执行初始同步。
    /// 已有运行中的会话时返回 `SyncError::AlreadyRunning`。
    pub async fn start(&self, saved: Option<ContinuationToken>) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        self.start_locked(saved).await
    }

    /// 用账本中的当前游标重新启动（前台恢复）
    pub async fn resume(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        let token = self.ledger.current().await;
        self.start_locked(token).await
    }

    /// 用游标存储中的值启动
    pub async fn resume_from_store(&self) -> Result<()> {
        let store = self
            .token_store
            .as_ref()
            .ok_or_else(|| SyncError::Config("未配置游标存储".to_string()))?;
        let saved = store.load().await?;
        info!(has_token = saved.is_some(), "从游标存储恢复同步");
        self.start(saved).await
    }

    async fn start_locked(&self, saved: Option<ContinuationToken>) -> Result<()> {
        self.retire_previous()?;

        let bootstrap = saved.is_none();
        match saved {
            Some(token) => self.ledger.set(Some(token)).await,
            None => self.ledger.reset().await,
        }

        let session = Arc::new(SyncSession::new());
        let cancel = CancellationToken::new();
        let mode = if bootstrap {
            SyncMode::Bootstrapping
        } else {
            SyncMode::Live
        };
        self.status.begin_session(&session, mode);
        info!(session_id = session.id(), bootstrap, "🚀 启动同步会话");

        let ctx = SessionContext {
            session: session.clone(),
            fetcher: self.fetcher.clone(),
            filters: self.filters,
            ledger: self.ledger.clone(),
            consumer: self.consumer.clone(),
            status: self.status.clone(),
            token_store: self.token_store.clone(),
            timing: self.config.timing.clone(),
            max_server_error_retries: self.config.max_server_error_retries,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(ctx.run(bootstrap));

        *self.running.lock() = Some(RunningSession {
            session,
            cancel,
            task,
        });
        Ok(())
    }

    /// 拒绝重复启动；已停止但尚未退出的会话移入排空列表
    fn retire_previous(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(RunningSession::is_live) {
            warn!("同步会话已在运行，拒绝重复 start");
            return Err(SyncError::AlreadyRunning);
        }
        if let Some(previous) = running.take() {
            if !previous.task.is_finished() {
                debug!(session_id = previous.session.id(), "旧会话仍在排空");
                let mut draining = self.draining.lock();
                draining.retain(|r| !r.task.is_finished());
                draining.push(previous);
            }
        }
        Ok(())
    }

    /// 停止当前会话
    ///
    /// 在途请求不会被取消；处于离线重试中的会话会继续重试，
    /// 成功后丢弃结果再退出。
    pub fn stop(&self) -> Result<()> {
        let running = self.running.lock();
        match running.as_ref() {
            Some(current) if !current.task.is_finished() => {
                if current.session.stop() {
                    info!(session_id = current.session.id(), "⏹️ 停止同步会话");
                }
                Ok(())
            }
            _ => Err(SyncError::NotRunning),
        }
    }

    /// 关闭引擎：取消所有会话任务（包括在途请求与冷却等待）并等待退出
    pub async fn shutdown(&self) {
        let _guard = self.start_lock.lock().await;
        let mut sessions: Vec<RunningSession> = self.draining.lock().drain(..).collect();
        if let Some(current) = self.running.lock().take() {
            sessions.push(current);
        }
        if sessions.is_empty() {
            return;
        }

        info!(sessions = sessions.len(), "关闭同步引擎");
        let tasks = sessions.into_iter().map(|running| {
            running.session.stop();
            running.cancel.cancel();
            running.task
        });
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("同步任务异常退出: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(RunningSession::is_live)
    }

    pub async fn current_token(&self) -> Option<ContinuationToken> {
        self.ledger.current().await
    }

    /// 宿主显式设置游标（同时持久化）
    pub async fn set_current_token(&self, token: Option<ContinuationToken>) -> Result<()> {
        self.ledger.set(token.clone()).await;
        if let Some(store) = &self.token_store {
            match &token {
                Some(token) => store.save(token).await?,
                None => store.clear().await?,
            }
        }
        Ok(())
    }

    /// 清空游标（登出 / 切换账号）
    pub async fn reset_token(&self) -> Result<()> {
        self.ledger.reset().await;
        if let Some(store) = &self.token_store {
            store.clear().await?;
        }
        Ok(())
    }

    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn log_status(&self) {
        self.status.log_state();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTokenStore;
    use crate::sync::FetchError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::Instant;

    type Reply = std::result::Result<Delta, FetchError>;

    enum Step {
        Reply(Reply),
        /// 请求挂起，直到测试通过 oneshot 给出结果
        Gate(oneshot::Receiver<Reply>),
    }

    struct Call {
        request: SyncRequest,
        at: Instant,
    }

    /// 按脚本应答；脚本耗尽后请求永远挂起（模拟长轮询）
    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        calls: mpsc::UnboundedSender<Call>,
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn fetch_delta(&self, request: &SyncRequest) -> Reply {
            let _ = self.calls.send(Call {
                request: request.clone(),
                at: Instant::now(),
            });
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Reply(reply)) => reply,
                Some(Step::Gate(rx)) => match rx.await {
                    Ok(reply) => reply,
                    Err(_) => futures::future::pending().await,
                },
                None => futures::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct RecordingConsumer {
        initial: Mutex<Vec<Option<ContinuationToken>>>,
        incremental: Mutex<Vec<Option<ContinuationToken>>>,
        complete: Mutex<Vec<bool>>,
        fail_once: AtomicBool,
    }

    #[async_trait]
    impl DeltaConsumer for RecordingConsumer {
        async fn apply_initial(&self, delta: Delta) -> Result<()> {
            self.initial.lock().push(delta.next_batch);
            Ok(())
        }

        async fn apply_incremental(&self, delta: Delta) -> Result<()> {
            if self.fail_once.swap(false, Ordering::SeqCst) {
                return Err(SyncError::Consumer("disk full".to_string()));
            }
            self.incremental.lock().push(delta.next_batch);
            Ok(())
        }

        async fn set_sync_complete(&self, complete: bool) {
            self.complete.lock().push(complete);
        }
    }

    struct Harness {
        engine: SyncEngine,
        consumer: Arc<RecordingConsumer>,
        calls: mpsc::UnboundedReceiver<Call>,
    }

    fn harness(steps: Vec<Step>) -> Harness {
        harness_with(SyncConfig::default(), steps)
    }

    fn harness_with(config: SyncConfig, steps: Vec<Step>) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            steps: Mutex::new(steps.into()),
            calls: tx,
        });
        let consumer = Arc::new(RecordingConsumer::default());
        let engine = SyncEngine::new(config, transport, consumer.clone()).unwrap();
        Harness {
            engine,
            consumer,
            calls: rx,
        }
    }

    fn tok(s: &str) -> ContinuationToken {
        ContinuationToken::new(s)
    }

    fn delta(next: &str) -> Reply {
        Ok(Delta {
            next_batch: Some(tok(next)),
            ..Default::default()
        })
    }

    fn network_down() -> Reply {
        Err(FetchError::Network("connection reset".to_string()))
    }

    fn server_error() -> Reply {
        Err(FetchError::ServerError {
            status: 502,
            errcode: None,
            message: "bad gateway".to_string(),
        })
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..100_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_then_live_uses_bootstrap_token() {
        let mut h = harness(vec![Step::Reply(delta("s1")), Step::Reply(delta("s2"))]);
        h.engine.start(None).await.unwrap();

        let first = h.calls.recv().await.unwrap().request;
        assert_eq!(first.since, None);
        assert!(first.full_state);
        assert_eq!(first.timeout_ms, 1_000);
        assert_eq!(first.filter, FilterBuilder::default().bootstrap_filter());

        let second = h.calls.recv().await.unwrap().request;
        assert_eq!(second.since, Some(tok("s1")));
        assert!(!second.full_state);
        assert_eq!(second.timeout_ms, 1_000);
        assert_eq!(second.filter, FilterBuilder::default().live_filter());

        let third = h.calls.recv().await.unwrap().request;
        assert_eq!(third.since, Some(tok("s2")));
        assert_eq!(third.timeout_ms, 60_000);
        assert!(third.request_id > second.request_id);

        assert_eq!(*h.consumer.initial.lock(), vec![Some(tok("s1"))]);
        assert_eq!(*h.consumer.incremental.lock(), vec![Some(tok("s2"))]);
        assert_eq!(*h.consumer.complete.lock(), vec![true, true]);
        assert_eq!(h.engine.current_token().await, Some(tok("s2")));

        let status = h.engine.status();
        assert_eq!(status.mode, SyncMode::Live);
        assert_eq!(status.stats.deltas_applied, 2);
        assert!(status.sync_complete);

        h.engine.shutdown().await;
        assert_eq!(h.engine.status().mode, SyncMode::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_skips_bootstrap() {
        let mut h = harness(vec![Step::Reply(delta("s2"))]);
        h.engine.start(Some(tok("saved"))).await.unwrap();

        let first = h.calls.recv().await.unwrap().request;
        assert_eq!(first.since, Some(tok("saved")));
        assert!(!first.full_state);
        assert_eq!(first.filter, FilterBuilder::default().live_filter());

        let second = h.calls.recv().await.unwrap().request;
        assert_eq!(second.since, Some(tok("s2")));
        assert!(h.consumer.initial.lock().is_empty());
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_backs_off_and_retries_same_token() {
        let mut h = harness(vec![Step::Reply(network_down()), Step::Reply(delta("s2"))]);
        let mut events = h.engine.subscribe();
        h.engine.start(Some(tok("s1"))).await.unwrap();

        let first = h.calls.recv().await.unwrap();
        let second = h.calls.recv().await.unwrap();
        assert_eq!(second.request.since, Some(tok("s1")));
        assert_eq!(second.request.filter, first.request.filter);
        assert_eq!(second.request.timeout_ms, first.request.timeout_ms);
        assert!(second.at - first.at >= Duration::from_millis(15_000));

        let third = h.calls.recv().await.unwrap();
        assert_eq!(third.request.since, Some(tok("s2")));
        assert!(!h.engine.status().offline);

        let offline_changes: Vec<bool> = drain_events(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::OfflineChanged { offline, .. } => Some(offline),
                _ => None,
            })
            .collect();
        assert_eq!(offline_changes, vec![true, false]);
        assert_eq!(*h.consumer.complete.lock(), vec![false, true]);
        assert_eq!(h.engine.status().stats.failed_requests, 1);
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_response_is_discarded() {
        let (gate_tx, gate_rx) = oneshot::channel();
        let mut h = harness(vec![Step::Gate(gate_rx), Step::Reply(delta("s3"))]);
        h.engine.start(Some(tok("s1"))).await.unwrap();

        let first = h.calls.recv().await.unwrap().request;
        assert_eq!(first.since, Some(tok("s1")));

        h.engine.set_current_token(Some(tok("other"))).await.unwrap();
        gate_tx.send(delta("s2")).unwrap();

        let second = h.calls.recv().await.unwrap().request;
        assert_eq!(second.since, Some(tok("other")));
        let third = h.calls.recv().await.unwrap().request;
        assert_eq!(third.since, Some(tok("s3")));

        assert_eq!(*h.consumer.incremental.lock(), vec![Some(tok("s3"))]);
        assert_eq!(h.engine.status().stats.stale_discarded, 1);
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_suppresses_late_success() {
        let (gate_tx, gate_rx) = oneshot::channel();
        let mut h = harness(vec![Step::Gate(gate_rx)]);
        h.engine.start(Some(tok("s1"))).await.unwrap();
        h.calls.recv().await.unwrap();

        h.engine.stop().unwrap();
        assert!(!h.engine.is_running());
        gate_tx.send(delta("s2")).unwrap();

        wait_until(|| h.engine.status().mode == SyncMode::Stopped).await;
        assert!(h.consumer.incremental.lock().is_empty());
        assert_eq!(h.engine.current_token().await, Some(tok("s1")));
        assert!(h.calls.try_recv().is_err());
        assert!(matches!(h.engine.stop(), Err(SyncError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_session_keeps_retrying_while_offline() {
        let mut h = harness(vec![Step::Reply(network_down()), Step::Reply(delta("s2"))]);
        h.engine.start(Some(tok("s1"))).await.unwrap();
        h.calls.recv().await.unwrap();

        wait_until(|| h.engine.status().offline).await;
        h.engine.stop().unwrap();

        let retry = h.calls.recv().await.unwrap().request;
        assert_eq!(retry.since, Some(tok("s1")));

        wait_until(|| h.engine.status().mode == SyncMode::Stopped).await;
        assert!(!h.engine.status().offline);
        assert!(h.consumer.incremental.lock().is_empty());
        assert_eq!(h.engine.current_token().await, Some(tok("s1")));
    }

    #[tokio::test(start_paused = true)]
    async fn credential_rejection_is_terminal_until_restart() {
        let mut h = harness(vec![Step::Reply(Err(FetchError::AuthRejected {
            errcode: "M_UNKNOWN_TOKEN".to_string(),
            message: "Invalid access token passed.".to_string(),
        }))]);
        let mut events = h.engine.subscribe();
        h.engine.start(Some(tok("s1"))).await.unwrap();
        h.calls.recv().await.unwrap();

        wait_until(|| h.engine.status().mode == SyncMode::Stopped).await;
        assert!(h.engine.status().credential_invalid);
        assert!(!h.engine.is_running());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.calls.try_recv().is_err());
        assert!(drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, SyncEvent::CredentialInvalidChanged { invalid: true, .. })));

        h.engine.start(Some(tok("s1"))).await.unwrap();
        assert!(!h.engine.status().credential_invalid);
        assert_eq!(h.calls.recv().await.unwrap().request.since, Some(tok("s1")));
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_while_running() {
        let mut h = harness(vec![]);
        h.engine.start(Some(tok("s1"))).await.unwrap();
        h.calls.recv().await.unwrap();

        assert!(matches!(
            h.engine.start(Some(tok("s2"))).await,
            Err(SyncError::AlreadyRunning)
        ));
        assert_eq!(h.engine.current_token().await, Some(tok("s1")));

        h.engine.stop().unwrap();
        h.engine.start(Some(tok("s3"))).await.unwrap();
        assert_eq!(h.calls.recv().await.unwrap().request.since, Some(tok("s3")));
        assert_eq!(h.engine.draining.lock().len(), 1);

        h.engine.shutdown().await;
        assert!(h.engine.draining.lock().is_empty());
        assert!(!h.engine.is_running());
        assert_eq!(h.engine.status().mode, SyncMode::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_ceiling_ends_session() {
        let config = SyncConfig::builder().max_server_error_retries(1).build();
        let mut h = harness_with(
            config,
            vec![Step::Reply(server_error()), Step::Reply(server_error())],
        );
        let mut events = h.engine.subscribe();
        h.engine.start(Some(tok("s1"))).await.unwrap();

        let first = h.calls.recv().await.unwrap();
        let second = h.calls.recv().await.unwrap();
        assert!(second.at - first.at >= Duration::from_millis(15_000));

        wait_until(|| h.engine.status().mode == SyncMode::Stopped).await;
        assert!(drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, SyncEvent::SyncError { .. })));
        assert!(!h.engine.status().credential_invalid);
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_failure_refetches_same_token() {
        let mut h = harness(vec![Step::Reply(delta("s2")), Step::Reply(delta("s2"))]);
        h.consumer.fail_once.store(true, Ordering::SeqCst);
        h.engine.start(Some(tok("s1"))).await.unwrap();

        let first = h.calls.recv().await.unwrap();
        let second = h.calls.recv().await.unwrap();
        assert_eq!(second.request.since, Some(tok("s1")));
        assert!(second.at - first.at >= Duration::from_millis(15_000));
        assert!(!h.engine.status().offline);

        let third = h.calls.recv().await.unwrap();
        assert_eq!(third.request.since, Some(tok("s2")));
        assert_eq!(*h.consumer.incremental.lock(), vec![Some(tok("s2"))]);
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_failure_reports_error_without_retry() {
        let mut h = harness(vec![Step::Reply(server_error())]);
        let mut events = h.engine.subscribe();
        h.engine.start(None).await.unwrap();
        h.calls.recv().await.unwrap();

        wait_until(|| h.engine.status().mode == SyncMode::Stopped).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.calls.try_recv().is_err());
        assert!(h.consumer.initial.lock().is_empty());
        assert!(drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, SyncEvent::SyncError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_auth_rejection_marks_credential_invalid() {
        let mut h = harness(vec![Step::Reply(Err(FetchError::AuthRejected {
            errcode: "M_MISSING_TOKEN".to_string(),
            message: "Missing access token".to_string(),
        }))]);
        let mut events = h.engine.subscribe();
        h.engine.start(None).await.unwrap();
        assert!(h.calls.recv().await.unwrap().request.full_state);

        wait_until(|| h.engine.status().mode == SyncMode::Stopped).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.calls.try_recv().is_err());
        assert!(!h.engine.is_running());

        let status = h.engine.status();
        assert!(status.credential_invalid);
        assert!(!status.sync_complete);
        assert!(h.consumer.initial.lock().is_empty());
        assert_eq!(*h.consumer.complete.lock(), vec![false]);

        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::CredentialInvalidChanged { invalid: true, .. })));
        assert!(events.iter().any(|e| matches!(e, SyncEvent::SyncError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn advanced_tokens_are_persisted() {
        let store = Arc::new(MemoryTokenStore::default());
        let Harness {
            engine,
            consumer: _,
            mut calls,
        } = harness(vec![Step::Reply(delta("s1")), Step::Reply(delta("s2"))]);
        let engine = engine.with_token_store(store.clone());

        engine.start(None).await.unwrap();
        for _ in 0..3 {
            calls.recv().await.unwrap();
        }
        assert_eq!(store.load().await.unwrap(), Some(tok("s2")));

        engine.shutdown().await;
        engine.reset_token().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
        assert_eq!(engine.current_token().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_from_store_uses_persisted_token() {
        let Harness {
            engine, mut calls, ..
        } = harness(vec![]);
        assert!(matches!(
            engine.resume_from_store().await,
            Err(SyncError::Config(_))
        ));

        let store = Arc::new(MemoryTokenStore::new(Some(tok("persisted"))));
        let engine = engine.with_token_store(store);
        engine.resume_from_store().await.unwrap();

        let first = calls.recv().await.unwrap().request;
        assert_eq!(first.since, Some(tok("persisted")));
        assert!(!first.full_state);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_request() {
        let mut h = harness(vec![]);
        h.engine.start(Some(tok("s1"))).await.unwrap();
        h.calls.recv().await.unwrap();
        assert!(h.engine.status().in_flight.is_some());

        h.engine.shutdown().await;
        let status = h.engine.status();
        assert!(!h.engine.is_running());
        assert_eq!(status.mode, SyncMode::Stopped);
        assert!(status.in_flight.is_none());
    }
}
