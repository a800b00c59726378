//! SDK 生命周期管理
//!
//! 管理 App 前后台切换等一级生命周期事件，统一触发各模块的状态切换。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Background,
    Foreground,
}

impl Transition {
    fn label(self) -> &'static str {
        match self {
            Transition::Background => "后台",
            Transition::Foreground => "前台",
        }
    }
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    pub async fn notify_background(&self) -> Result<()> {
        self.notify(Transition::Background).await
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        self.notify(Transition::Foreground).await
    }

    /// 按注册顺序执行；某个 Hook 失败时记录并继续，最后返回第一个错误
    async fn notify(&self, transition: Transition) -> Result<()> {
        let label = transition.label();
        info!("🔄 通知所有模块：App 切换到{}", label);

        let mut first_error = None;
        let mut failures = 0usize;

        for (index, hook) in self.hooks.iter().enumerate() {
            let result = match transition {
                Transition::Background => hook.on_background().await,
                Transition::Foreground => hook.on_foreground().await,
            };
            if let Err(e) = result {
                warn!("⚠️ Hook #{} {}切换失败: {}", index, label, e);
                failures += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                warn!("⚠️ {} 个模块{}切换失败，但所有模块都已尝试执行", failures, label);
                Err(e)
            }
            None => {
                info!("✅ 所有模块{}切换完成", label);
                Ok(())
            }
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

// 同步引擎的前后台 Hook
mod sync_hook;
pub use sync_hook::SyncLifecycleHook;
