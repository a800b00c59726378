//! Delta 拉取
//!
//! 包装一次长轮询请求：给定游标（可空）、过滤器、超时，返回 Delta 或已分类的失败。
//! 不修改会话状态，也不推进游标。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::delta::Delta;
use super::filter::SyncFilter;
use super::ContinuationToken;

/// 服务器报告凭证失效的错误码
pub const UNKNOWN_TOKEN_ERRCODE: &str = "M_UNKNOWN_TOKEN";
pub const MISSING_TOKEN_ERRCODE: &str = "M_MISSING_TOKEN";

/// 拉取失败分类（同步循环只依据分类决定重试还是终止）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// 没有拿到响应：DNS / 连接 / 超时 / 读取响应体失败
    #[error("network error: {0}")]
    Network(String),
    /// 服务器判定凭证无效
    #[error("credential rejected [{errcode}]: {message}")]
    AuthRejected { errcode: String, message: String },
    /// 其它非 2xx（或 2xx 但响应体无法解析）
    #[error("server error [{status}] {errcode:?}: {message}")]
    ServerError {
        status: u16,
        errcode: Option<String>,
        message: String,
    },
}

impl FetchError {
    /// 按服务器返回的错误码分类
    pub fn from_server(status: u16, errcode: Option<String>, message: String) -> Self {
        match errcode.as_deref() {
            Some(UNKNOWN_TOKEN_ERRCODE) | Some(MISSING_TOKEN_ERRCODE) => FetchError::AuthRejected {
                errcode: errcode.unwrap_or_default(),
                message,
            },
            _ => FetchError::ServerError {
                status,
                errcode,
                message,
            },
        }
    }

    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, FetchError::AuthRejected { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// 一次 sync 请求的全部参数
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    /// 请求序号（单调递增，仅用于日志与在途标识）
    pub request_id: u64,
    pub since: Option<ContinuationToken>,
    pub filter: SyncFilter,
    /// 服务器端长轮询预算
    pub timeout_ms: u64,
    pub full_state: bool,
}

/// 传输层（HTTP 绑定由实现方提供）
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn fetch_delta(&self, request: &SyncRequest) -> Result<Delta, FetchError>;
}

/// Delta 拉取器
#[derive(Clone)]
pub struct DeltaFetcher {
    transport: Arc<dyn SyncTransport>,
    next_request_id: Arc<AtomicU64>,
}

impl DeltaFetcher {
    pub fn new(transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            transport,
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// 分配下一个请求序号
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 构造请求；full_state 只允许与空游标搭配
    pub fn prepare(
        &self,
        token: Option<&ContinuationToken>,
        filter: &SyncFilter,
        timeout_ms: u64,
        full_state: bool,
    ) -> SyncRequest {
        let full_state = if full_state && token.is_some() {
            warn!("full_state 请求携带了游标，已降级为增量请求");
            false
        } else {
            full_state
        };
        SyncRequest {
            request_id: self.next_request_id(),
            since: token.cloned(),
            filter: filter.clone(),
            timeout_ms,
            full_state,
        }
    }

    /// 发出一次请求
    pub async fn fetch(
        &self,
        token: Option<&ContinuationToken>,
        filter: &SyncFilter,
        timeout_ms: u64,
        full_state: bool,
    ) -> Result<Delta, FetchError> {
        let request = self.prepare(token, filter, timeout_ms, full_state);
        self.execute(&request).await
    }

    /// 发出一个已构造好的请求
    pub async fn execute(&self, request: &SyncRequest) -> Result<Delta, FetchError> {
        debug!(
            request_id = request.request_id,
            since = ?request.since,
            timeout_ms = request.timeout_ms,
            full_state = request.full_state,
            "发起 sync 请求"
        );
        let result = self.transport.fetch_delta(request).await;
        match &result {
            Ok(delta) => debug!(
                request_id = request.request_id,
                next_batch = ?delta.next_batch,
                rooms = delta.room_count(),
                "sync 请求成功"
            ),
            Err(e) => debug!(request_id = request.request_id, error = %e, "sync 请求失败"),
        }
        result
    }
}
