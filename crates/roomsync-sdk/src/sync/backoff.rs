use std::time::Duration;

use crate::config::SyncTimingConfig;
use crate::sync::FetchError;

/// 失败后的处理决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffDecision {
    /// 冷却后用同一游标重试
    Retry(Duration),
    /// 凭证失效，会话终止，等待宿主重新登录
    CredentialInvalid,
    /// 连续 ServerError 超过上限，会话终止
    GiveUp { attempts: u32 },
}

/// 固定冷却的重试策略
///
/// 网络错误无限重试；ServerError 默认同样无限重试，可配置连续次数上限。
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    delay: Duration,
    max_server_error_retries: Option<u32>,
    server_error_streak: u32,
}

impl BackoffPolicy {
    pub fn new(delay: Duration, max_server_error_retries: Option<u32>) -> Self {
        Self {
            delay,
            max_server_error_retries,
            server_error_streak: 0,
        }
    }

    pub fn from_timing(timing: &SyncTimingConfig, max_server_error_retries: Option<u32>) -> Self {
        Self::new(
            Duration::from_millis(timing.backoff_delay_ms),
            max_server_error_retries,
        )
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// 成功后清零
    pub fn reset(&mut self) {
        self.server_error_streak = 0;
    }

    /// 拉取失败
    pub fn on_fetch_error(&mut self, error: &FetchError) -> BackoffDecision {
        match error {
            FetchError::AuthRejected { .. } => BackoffDecision::CredentialInvalid,
            FetchError::Network(_) => {
                self.server_error_streak = 0;
                BackoffDecision::Retry(self.delay)
            }
            FetchError::ServerError { .. } => {
                self.server_error_streak = self.server_error_streak.saturating_add(1);
                match self.max_server_error_retries {
                    Some(limit) if self.server_error_streak > limit => BackoffDecision::GiveUp {
                        attempts: self.server_error_streak,
                    },
                    _ => BackoffDecision::Retry(self.delay),
                }
            }
        }
    }
}
