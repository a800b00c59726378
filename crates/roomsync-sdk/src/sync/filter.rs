//! 同步过滤器构造
//!
//! 两种过滤器：
//! - bootstrap：只拉房间 state，timeline / ephemeral 为空（不下发历史消息）
//! - live：有界 timeline 分页 + 成员懒加载 + 已读回执 + 在线状态 + 私聊映射
//!
//! 每次调用都返回新值，不在原地修改。

use serde::{Deserialize, Serialize};

/// timeline 分页默认条数（与宿主分页增量共用）
pub const DEFAULT_PAGE_SIZE: u32 = 100;

const BOOTSTRAP_STATE_TYPES: &[&str] = &[
    "m.room.third_party_invite",
    "m.room.member",
    "m.room.name",
    "m.room.avatar",
    "m.room.canonical_alias",
    "m.room.join_rules",
    "m.room.power_levels",
    "m.room.topic",
    "m.room.create",
];

const LIVE_TIMELINE_TYPES: &[&str] = &[
    "m.room.third_party_invite",
    "m.room.redaction",
    "m.room.message",
    "m.room.member",
    "m.room.name",
    "m.room.avatar",
    "m.room.canonical_alias",
    "m.room.join_rules",
    "m.room.power_levels",
    "m.room.topic",
    "m.room.encrypted",
    "m.room.create",
];

const LIVE_STATE_TYPES: &[&str] = &[
    "m.room.member",
    "m.room.name",
    "m.room.avatar",
    "m.room.canonical_alias",
    "m.room.join_rules",
    "m.room.power_levels",
    "m.room.topic",
    "m.room.create",
];

/// 单个范围的事件过滤
///
/// `types` 为空表示整个范围都不要，而不是「全部都要」，所以序列化时总是输出。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lazy_load_members: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl EventFilter {
    /// 排除整个范围
    pub fn excluded() -> Self {
        Self {
            types: Vec::new(),
            lazy_load_members: None,
            limit: Some(0),
        }
    }

    pub fn of_types(types: &[&str]) -> Self {
        Self {
            types: types.iter().map(|t| t.to_string()).collect(),
            lazy_load_members: None,
            limit: None,
        }
    }

    pub fn with_lazy_members(mut self) -> Self {
        self.lazy_load_members = Some(true);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// 该范围是否被整体排除
    pub fn is_excluded(&self) -> bool {
        self.types.is_empty()
    }
}

/// 房间级过滤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomFilter {
    pub timeline: EventFilter,
    pub state: EventFilter,
    pub ephemeral: EventFilter,
    pub account_data: EventFilter,
    pub include_leave: bool,
}

/// 完整的 sync 过滤器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFilter {
    pub room: RoomFilter,
    pub account_data: EventFilter,
    pub presence: EventFilter,
}

impl SyncFilter {
    /// 序列化为 `filter` 查询参数
    pub fn to_query_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// 过滤器构造器（仅持有静态配置）
#[derive(Debug, Clone, Copy)]
pub struct FilterBuilder {
    page_size: u32,
}

impl Default for FilterBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl FilterBuilder {
    pub fn new(page_size: u32) -> Self {
        Self { page_size }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// 首次同步：只要当前房间 state，不要消息 backlog
    pub fn bootstrap_filter(&self) -> SyncFilter {
        SyncFilter {
            room: RoomFilter {
                timeline: EventFilter::excluded(),
                state: EventFilter::of_types(BOOTSTRAP_STATE_TYPES).with_lazy_members(),
                ephemeral: EventFilter::excluded(),
                account_data: EventFilter::excluded(),
                include_leave: false,
            },
            account_data: EventFilter::of_types(&["m.direct", "m.push_rules"]),
            presence: EventFilter::of_types(&["m.presence"]),
        }
    }

    /// 长轮询：有界 timeline 页
    pub fn live_filter(&self) -> SyncFilter {
        SyncFilter {
            room: RoomFilter {
                timeline: EventFilter::of_types(LIVE_TIMELINE_TYPES)
                    .with_limit(self.page_size)
                    .with_lazy_members(),
                state: EventFilter::of_types(LIVE_STATE_TYPES).with_lazy_members(),
                ephemeral: EventFilter::of_types(&["m.receipt"]).with_lazy_members(),
                account_data: EventFilter::excluded(),
                include_leave: true,
            },
            account_data: EventFilter::of_types(&["m.direct"]),
            presence: EventFilter::of_types(&["m.presence"]),
        }
    }
}
