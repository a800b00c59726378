//! 同步引擎配置

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::sync::filter::DEFAULT_PAGE_SIZE;

/// 客户端 API 前缀
pub const CLIENT_API_PREFIX: &str = "/_matrix/client/v3";

/// 同步时序配置（毫秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTimingConfig {
    /// 长轮询服务器端超时
    pub long_poll_timeout_ms: u64,
    /// 失败后的固定冷却时间
    pub backoff_delay_ms: u64,
    /// bootstrap 请求超时（只拉 state，不需要长轮询等待）
    pub bootstrap_timeout_ms: u64,
    /// 每个会话首个 live 请求的超时，尽快拿到最新数据
    pub catch_up_timeout_ms: u64,
    /// 客户端超时在服务器超时基础上的余量
    pub transport_margin_ms: u64,
}

impl Default for SyncTimingConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout_ms: 60_000,
            backoff_delay_ms: 15_000,
            bootstrap_timeout_ms: 1_000,
            catch_up_timeout_ms: 1_000,
            transport_margin_ms: 10_000,
        }
    }
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// homeserver 基础 URL，例如 https://matrix.example.org
    pub homeserver_url: String,
    /// 访问令牌（Bearer）
    pub access_token: Option<String>,
    /// 当前用户 ID（用于游标持久化的命名空间）
    pub user_id: Option<String>,
    /// 数据存储目录（游标 KV）
    pub data_dir: PathBuf,
    /// 时序参数
    pub timing: SyncTimingConfig,
    /// timeline 分页条数（宿主分页增量）
    pub page_size: u32,
    /// 随 sync 上报的在线状态
    pub set_presence: String,
    /// 连续 ServerError 的重试上限；None 表示无限重试
    pub max_server_error_retries: Option<u32>,
    /// HTTP 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            homeserver_url: String::new(),
            access_token: None,
            user_id: None,
            data_dir: get_default_data_dir(),
            timing: SyncTimingConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            set_presence: "online".to_string(),
            max_server_error_retries: None,
            connect_timeout_secs: 30,
            event_buffer_size: 256,
        }
    }
}

/// 获取默认数据目录 ~/.roomsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".roomsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".roomsync")
    } else {
        PathBuf::from("./roomsync_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 从宿主提供的 JSON 读取，缺失字段取默认值
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 校验时序参数
    pub fn validate(&self) -> Result<()> {
        let timing = &self.timing;
        if timing.long_poll_timeout_ms == 0
            || timing.bootstrap_timeout_ms == 0
            || timing.catch_up_timeout_ms == 0
        {
            return Err(SyncError::Config("sync 超时不能为 0".to_string()));
        }
        // 客户端超时 = 服务器超时 + 余量，必须严格大于服务器超时
        if timing.transport_margin_ms == 0 {
            return Err(SyncError::Config("传输超时余量不能为 0".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("timeline 分页条数不能为 0".to_string()));
        }
        Ok(())
    }

    /// HTTP 传输需要的额外校验
    pub fn validate_for_http(&self) -> Result<()> {
        self.validate()?;
        let url = self.homeserver_url.trim();
        if url.is_empty() {
            return Err(SyncError::Config("未配置 homeserver_url".to_string()));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(SyncError::Config(format!(
                "homeserver_url 必须以 http(s):// 开头: {}",
                url
            )));
        }
        Ok(())
    }

    /// 完整的 sync 端点 URL
    pub fn sync_endpoint(&self) -> String {
        format!(
            "{}{}/sync",
            self.homeserver_url.trim_end_matches('/'),
            CLIENT_API_PREFIX
        )
    }
}

/// 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn homeserver<S: Into<String>>(mut self, url: S) -> Self {
        self.config.homeserver_url = url.into();
        self
    }

    pub fn access_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.access_token = Some(token.into());
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.user_id = Some(user_id.into());
        self
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn long_poll_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timing.long_poll_timeout_ms = ms;
        self
    }

    pub fn backoff_delay_ms(mut self, ms: u64) -> Self {
        self.config.timing.backoff_delay_ms = ms;
        self
    }

    pub fn bootstrap_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timing.bootstrap_timeout_ms = ms;
        self
    }

    pub fn catch_up_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timing.catch_up_timeout_ms = ms;
        self
    }

    pub fn transport_margin_ms(mut self, ms: u64) -> Self {
        self.config.timing.transport_margin_ms = ms;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn set_presence<S: Into<String>>(mut self, presence: S) -> Self {
        self.config.set_presence = presence.into();
        self
    }

    pub fn max_server_error_retries(mut self, limit: u32) -> Self {
        self.config.max_server_error_retries = Some(limit);
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}
