//! Delta 消费方接口
//!
//! 同步引擎只负责按序交付；房间 / 成员 / 消息的物化由消费方完成。
//! 交给消费方的 Delta 归其独占，可以直接拆解使用。

use async_trait::async_trait;

use crate::error::Result;
use crate::sync::delta::Delta;

#[async_trait]
pub trait DeltaConsumer: Send + Sync {
    /// 首次同步（bootstrap）结果：整体构建房间对象
    async fn apply_initial(&self, delta: Delta) -> Result<()>;

    /// 增量同步结果：在已有状态上打补丁
    async fn apply_incremental(&self, delta: Delta) -> Result<()>;

    /// 同步完成 / 停滞标记（UI 据此展示断开状态）
    async fn set_sync_complete(&self, complete: bool);
}
