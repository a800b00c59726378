//! 同步引擎生命周期 Hook
//!
//! 切到后台时停止长轮询；回到前台时用当前游标恢复。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::lifecycle::LifecycleHook;
use crate::sync::SyncEngine;

pub struct SyncLifecycleHook {
    engine: Arc<SyncEngine>,
}

impl SyncLifecycleHook {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        match self.engine.stop() {
            Ok(()) => {
                info!("[Sync Hook] App 切换到后台，已停止同步");
                Ok(())
            }
            Err(SyncError::NotRunning) => {
                debug!("[Sync Hook] 同步未运行，无需停止");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_foreground(&self) -> Result<()> {
        if self.engine.status().credential_invalid {
            warn!("[Sync Hook] 访问令牌已失效，等待重新登录，不恢复同步");
            return Ok(());
        }
        if self.engine.is_running() {
            debug!("[Sync Hook] 同步已在运行");
            return Ok(());
        }

        match self.engine.resume().await {
            Ok(()) => {
                info!("[Sync Hook] App 切换到前台，已恢复同步");
                Ok(())
            }
            // 与另一个 start 并发，已有会话在运行
            Err(SyncError::AlreadyRunning) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
