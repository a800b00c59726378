//! HTTP 传输模块 - `GET /_matrix/client/v3/sync`
//!
//! 使用 reqwest（rustls）发起长轮询请求，并把失败归入 `FetchError` 的三个分类。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::sync::{Delta, FetchError, SyncRequest, SyncTransport};

/// 服务器错误响应体
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// 基于 reqwest 的 sync 传输
pub struct HttpSyncTransport {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
    set_presence: String,
    transport_margin: Duration,
}

impl HttpSyncTransport {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(crate::version::user_agent())
            .build()
            .map_err(|e| SyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        let endpoint = config.sync_endpoint();
        info!("✅ HTTP 客户端已创建 (endpoint: {})", endpoint);

        Ok(Self {
            client,
            endpoint,
            access_token: config.access_token.clone(),
            set_presence: config.set_presence.clone(),
            transport_margin: Duration::from_millis(config.timing.transport_margin_ms),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn query(&self, request: &SyncRequest) -> std::result::Result<Vec<(&'static str, String)>, FetchError> {
        let filter = request.filter.to_query_json().map_err(|e| FetchError::ServerError {
            status: 0,
            errcode: None,
            message: format!("序列化过滤器失败: {}", e),
        })?;

        let mut query = vec![
            ("timeout", request.timeout_ms.to_string()),
            ("filter", filter),
            ("full_state", request.full_state.to_string()),
            ("set_presence", self.set_presence.clone()),
        ];
        if let Some(since) = &request.since {
            query.push(("since", since.as_str().to_string()));
        }
        Ok(query)
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn fetch_delta(&self, request: &SyncRequest) -> std::result::Result<Delta, FetchError> {
        let query = self.query(request)?;

        // 客户端超时必须大于服务器端长轮询预算
        let timeout = Duration::from_millis(request.timeout_ms) + self.transport_margin;
        let mut builder = self.client.get(&self.endpoint).query(&query).timeout(timeout);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(format!("读取响应体失败: {}", e)))?;

        if !status.is_success() {
            let parsed: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
            let message = parsed.error.unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            });
            debug!(
                request_id = request.request_id,
                status = status.as_u16(),
                errcode = ?parsed.errcode,
                "sync 返回错误状态"
            );
            return Err(FetchError::from_server(status.as_u16(), parsed.errcode, message));
        }

        Delta::from_json(&body).map_err(|e| FetchError::ServerError {
            status: status.as_u16(),
            errcode: None,
            message: format!("无法解析 sync 响应: {}", e),
        })
    }
}
