//! sync 响应数据模型
//!
//! 事件 content 统一保留为 `serde_json::Value`，具体解释交给消费方。
//! 缺失的段落按空处理，未知字段忽略。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ContinuationToken;

/// 客户端事件（timeline / state / presence 通用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
}

/// 通用事件列表 `{ "events": [...] }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventList<E = ClientEvent> {
    #[serde(default = "Vec::new")]
    pub events: Vec<E>,
}

impl<E> Default for EventList<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E> EventList<E> {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// 无 event_id 的轻量事件（ephemeral / account_data / to_device）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<ClientEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSummaryFragment {
    #[serde(rename = "m.joined_member_count", default, skip_serializing_if = "Option::is_none")]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count", default, skip_serializing_if = "Option::is_none")]
    pub invited_member_count: Option<u64>,
    #[serde(rename = "m.heroes", default)]
    pub heroes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnreadNotifications {
    #[serde(default)]
    pub notification_count: u64,
    #[serde(default)]
    pub highlight_count: u64,
}

/// 单个房间的增量片段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomFragment {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub invite_state: EventList,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub ephemeral: EventList<BasicEvent>,
    #[serde(default)]
    pub account_data: EventList<BasicEvent>,
    #[serde(default)]
    pub summary: RoomSummaryFragment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_notifications: Option<UnreadNotifications>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: HashMap<String, RoomFragment>,
    #[serde(default)]
    pub invite: HashMap<String, RoomFragment>,
    #[serde(default)]
    pub leave: HashMap<String, RoomFragment>,
}

impl Rooms {
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.invite.is_empty() && self.leave.is_empty()
    }
}

/// 一次 sync 请求返回的增量
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// 下一次请求使用的游标
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<ContinuationToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Rooms>,
    #[serde(default)]
    pub presence: EventList,
    #[serde(default)]
    pub account_data: EventList<BasicEvent>,
    #[serde(default)]
    pub to_device: EventList<BasicEvent>,
}

impl Delta {
    /// 从原始 JSON 解析
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// 房间数（join + invite + leave）
    pub fn room_count(&self) -> usize {
        self.rooms
            .as_ref()
            .map(|r| r.join.len() + r.invite.len() + r.leave.len())
            .unwrap_or(0)
    }

    /// 所有已加入房间的 timeline 事件数
    pub fn timeline_event_count(&self) -> usize {
        self.rooms
            .as_ref()
            .map(|r| r.join.values().map(|room| room.timeline.events.len()).sum())
            .unwrap_or(0)
    }

    /// 是否没有任何负载（只有游标）
    pub fn is_empty(&self) -> bool {
        self.rooms.as_ref().map(Rooms::is_empty).unwrap_or(true)
            && self.presence.is_empty()
            && self.account_data.is_empty()
            && self.to_device.is_empty()
    }
}
