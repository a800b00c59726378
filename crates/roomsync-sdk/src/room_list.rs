//! 房间列表 - 参考 Delta 消费方
//!
//! 把 sync 增量折叠为房间摘要：
//! - 房间阶段（invite / join / leave）与类型（direct / group / community / notepad）
//! - 名称、话题、头像、别名、成员、成员数
//! - 最近的 timeline 事件（按房间限长）、撤回、未读数、已读回执
//! - `m.direct` 私聊映射与用户最后活跃时间

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::sync::delta::{BasicEvent, ClientEvent, RoomFragment, RoomSummaryFragment, Timeline};
use crate::sync::{Delta, DeltaConsumer};

/// 每个房间默认保留的 timeline 事件数
pub const DEFAULT_TIMELINE_CAPACITY: usize = 500;

/// 房间阶段（排序时 invite 在前）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoomPhase {
    Invite,
    Join,
    Leave,
}

/// 房间类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomType {
    /// 一对一私聊
    Direct,
    /// 私有群组
    Group,
    /// 公开社区
    Community,
    /// 只有自己的记事本
    Notepad,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub membership: Option<String>,
    pub power_level: Option<i64>,
    pub is_direct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub event_id: String,
    /// UTC毫秒时间戳
    pub timestamp: i64,
}

/// 房间摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: String,
    pub phase: RoomPhase,
    pub room_type: Option<RoomType>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    pub alias: Option<String>,
    pub join_rule: Option<String>,
    /// 私聊对方
    pub contact_id: Option<String>,
    pub third_party_invite: Option<String>,
    pub members: HashMap<String, RoomMember>,
    pub joined_member_count: Option<u64>,
    pub invited_member_count: Option<u64>,
    pub heroes: Vec<String>,
    /// 最近的 timeline 事件（旧 → 新）
    pub timeline: VecDeque<ClientEvent>,
    /// 向前分页的游标
    pub timeline_token: Option<String>,
    pub timeline_limited: bool,
    /// 最近一批新事件（新 → 旧）
    pub new_events: Vec<ClientEvent>,
    pub new_events_limited: bool,
    pub redacted_events: Vec<String>,
    pub unread_count: u64,
    pub active: bool,
    pub read_receipts: HashMap<String, ReadReceipt>,
}

impl RoomSummary {
    fn new(id: &str, phase: RoomPhase) -> Self {
        Self {
            id: id.to_string(),
            phase,
            room_type: None,
            name: None,
            topic: None,
            avatar_url: None,
            alias: None,
            join_rule: None,
            contact_id: None,
            third_party_invite: None,
            members: HashMap::new(),
            joined_member_count: None,
            invited_member_count: None,
            heroes: Vec::new(),
            timeline: VecDeque::new(),
            timeline_token: None,
            timeline_limited: false,
            new_events: Vec::new(),
            new_events_limited: false,
            redacted_events: Vec::new(),
            // 邀请默认算一条未读
            unread_count: if phase == RoomPhase::Invite { 1 } else { 0 },
            active: false,
            read_receipts: HashMap::new(),
        }
    }

    fn is_community(&self) -> bool {
        self.room_type == Some(RoomType::Community)
    }

    /// 最新事件时间，用于排序
    fn latest_activity(&self) -> i64 {
        self.new_events
            .first()
            .map(|e| e.origin_server_ts)
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct RoomListState {
    /// 每个房间保留的 timeline 事件数，同时限制撤回记录
    timeline_capacity: usize,
    rooms: HashMap<String, RoomSummary>,
    /// room_id -> 私聊对方 user_id
    direct_rooms: HashMap<String, String>,
    /// user_id -> 最后活跃时间（UTC毫秒时间戳）
    last_seen: HashMap<String, i64>,
}

impl RoomListState {
    fn new(timeline_capacity: usize) -> Self {
        Self {
            timeline_capacity,
            rooms: HashMap::new(),
            direct_rooms: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }
}

fn str_field(content: &Value, key: &str) -> Option<String> {
    content.get(key).and_then(Value::as_str).map(str::to_string)
}

impl RoomListState {
    fn set_direct_rooms(&mut self, account_data: &[BasicEvent]) {
        let Some(direct) = account_data.iter().find(|e| e.event_type == "m.direct") else {
            return;
        };
        let Some(map) = direct.content.as_object() else {
            return;
        };
        for (contact_id, room_ids) in map {
            for room_id in room_ids.as_array().into_iter().flatten().filter_map(Value::as_str) {
                self.direct_rooms.insert(room_id.to_string(), contact_id.clone());
            }
        }
    }

    fn touch_last_seen(&mut self, user_id: &str, timestamp: i64) {
        let entry = self.last_seen.entry(user_id.to_string()).or_insert(0);
        *entry = (*entry).max(timestamp);
    }

    /// 根据 state / timeline 事件更新房间信息
    fn apply_events(&mut self, room: &mut RoomSummary, events: &[ClientEvent]) {
        for event in events {
            let content = &event.content;
            match event.event_type.as_str() {
                "m.room.message" => {
                    if !room.is_community() {
                        self.touch_last_seen(&event.sender, event.origin_server_ts);
                    }
                }
                "m.room.member" => {
                    if !room.is_community() {
                        self.touch_last_seen(&event.sender, event.origin_server_ts);
                    }
                    self.apply_member(room, event);
                }
                "m.room.redaction" => {
                    if let Some(redacts) = &event.redacts {
                        redact(room, redacts, self.timeline_capacity);
                    }
                }
                "m.room.name" => room.name = str_field(content, "name"),
                "m.room.avatar" => room.avatar_url = str_field(content, "url"),
                "m.room.canonical_alias" => room.alias = str_field(content, "alias"),
                "m.room.join_rules" => room.join_rule = str_field(content, "join_rule"),
                "m.room.topic" => room.topic = str_field(content, "topic"),
                "m.room.power_levels" => {
                    if let Some(users) = content.get("users").and_then(Value::as_object) {
                        for (user_id, level) in users {
                            let member = room
                                .members
                                .entry(user_id.clone())
                                .or_insert_with(|| RoomMember {
                                    user_id: user_id.clone(),
                                    ..Default::default()
                                });
                            member.power_level = level.as_i64();
                        }
                    }
                }
                "m.room.third_party_invite" => {
                    room.third_party_invite = str_field(content, "display_name");
                }
                "m.room.create" => {
                    if content.get("is_notepad").and_then(Value::as_bool) == Some(true) {
                        room.room_type = Some(RoomType::Notepad);
                        room.active = true;
                    }
                }
                _ => {}
            }
        }
    }

    fn apply_member(&self, room: &mut RoomSummary, event: &ClientEvent) {
        let Some(user_id) = event.state_key.clone() else {
            return;
        };
        let content = &event.content;
        let member = room
            .members
            .entry(user_id.clone())
            .or_insert_with(|| RoomMember {
                user_id,
                ..Default::default()
            });
        member.display_name = str_field(content, "displayname");
        member.avatar_url = str_field(content, "avatar_url");
        member.membership = str_field(content, "membership");
        if content.get("is_direct").and_then(Value::as_bool) == Some(true) {
            member.is_direct = true;
        }

        // 第三方邀请被接受后重新确定私聊对象
        if room.third_party_invite.is_some() && content.get("third_party_signed").is_some() {
            room.third_party_invite = None;
            room.contact_id = None;
            self.set_contact_id(room, None);
        }
    }

    fn apply_summary(room: &mut RoomSummary, summary: &RoomSummaryFragment) {
        if let Some(count) = summary.joined_member_count {
            room.joined_member_count = Some(count);
        }
        if let Some(count) = summary.invited_member_count {
            room.invited_member_count = Some(count);
        }
        if !summary.heroes.is_empty() {
            room.heroes = summary.heroes.clone();
        }
    }

    /// 确定房间类型；`fallback_direct` 为 false 时只有成员带 is_direct 才判为私聊
    fn set_room_type(&self, room: &mut RoomSummary, fallback_direct: bool) {
        if room.room_type.is_some() {
            return;
        }
        room.room_type = if self.direct_rooms.contains_key(&room.id) {
            Some(RoomType::Direct)
        } else if room.join_rule.as_deref() == Some("public") {
            Some(RoomType::Community)
        } else if room.name.is_some() {
            Some(RoomType::Group)
        } else if fallback_direct || room.members.values().any(|m| m.is_direct) {
            Some(RoomType::Direct)
        } else {
            None
        };
    }

    fn set_contact_id(&self, room: &mut RoomSummary, own_user_id: Option<&str>) {
        let contact = if let Some(contact) = self.direct_rooms.get(&room.id) {
            contact.clone()
        } else if room.members.len() > 1 {
            let mut others: Vec<&String> = room
                .members
                .keys()
                .filter(|id| Some(id.as_str()) != own_user_id)
                .collect();
            others.sort();
            match others.first() {
                Some(id) => (*id).clone(),
                None => "unknown".to_string(),
            }
        } else if let Some(hero) = room.heroes.first() {
            hero.clone()
        } else if let Some(invite) = &room.third_party_invite {
            invite.clone()
        } else {
            "unknown".to_string()
        };
        room.contact_id = Some(contact);
    }

    fn update_active(room: &mut RoomSummary) {
        room.active = match room.room_type {
            Some(RoomType::Community) | Some(RoomType::Notepad) => true,
            Some(RoomType::Direct) => room
                .contact_id
                .as_ref()
                .and_then(|id| room.members.get(id))
                .and_then(|m| m.membership.as_deref())
                == Some("join"),
            _ => room.joined_member_count.unwrap_or(0) > 1,
        };
    }

    fn apply_receipts(&mut self, room: &mut RoomSummary, ephemeral: &[BasicEvent]) {
        for event in ephemeral.iter().filter(|e| e.event_type == "m.receipt") {
            let Some(by_event) = event.content.as_object() else {
                continue;
            };
            for (event_id, receipt_types) in by_event {
                let Some(readers) = receipt_types.get("m.read").and_then(Value::as_object) else {
                    continue;
                };
                for (user_id, receipt) in readers {
                    let timestamp = receipt.get("ts").and_then(Value::as_i64).unwrap_or(0);
                    room.read_receipts.insert(
                        user_id.clone(),
                        ReadReceipt {
                            event_id: event_id.clone(),
                            timestamp,
                        },
                    );
                    self.touch_last_seen(user_id, timestamp);
                }
            }
        }
    }

    fn apply_presence(&mut self, presence: &[ClientEvent], now: i64) {
        for event in presence.iter().filter(|e| e.event_type == "m.presence") {
            let ago = event.content.get("last_active_ago").and_then(Value::as_i64);
            if let Some(ago) = ago.filter(|ago| *ago >= 0) {
                self.touch_last_seen(&event.sender, now.saturating_sub(ago));
            }
        }
    }

    /// 从 timeline 推断活跃时间：每个发送者只看其最新一条
    fn presence_from_timeline(&mut self, room: &RoomSummary) {
        let mut senders = HashSet::new();
        for event in room.timeline.iter().rev() {
            if senders.insert(event.sender.clone()) {
                self.touch_last_seen(&event.sender, event.origin_server_ts);
            }
        }
    }
}

fn redact(room: &mut RoomSummary, redacts: &str, capacity: usize) {
    room.redacted_events.push(redacts.to_string());
    if room.redacted_events.len() > capacity {
        let excess = room.redacted_events.len() - capacity;
        room.redacted_events.drain(..excess);
    }
    let strip = |event: &mut ClientEvent| {
        if event.event_id.as_deref() == Some(redacts) {
            event.content = Value::Object(Default::default());
        }
    };
    room.timeline.iter_mut().for_each(strip);
    room.new_events.iter_mut().for_each(strip);
}

fn update_timeline(room: &mut RoomSummary, timeline: &Timeline, capacity: usize) {
    if timeline.limited {
        // 中间有缺口：丢弃旧事件，从 prev_batch 重新分页
        room.timeline = timeline.events.iter().cloned().collect();
        room.timeline_token = timeline.prev_batch.clone();
        room.timeline_limited = true;
    } else {
        room.timeline.extend(timeline.events.iter().cloned());
    }
    while room.timeline.len() > capacity {
        room.timeline.pop_front();
    }
}

fn update_new_events(room: &mut RoomSummary, timeline: &Timeline) {
    room.new_events_limited = timeline.limited;
    let fresh: Vec<ClientEvent> = timeline
        .events
        .iter()
        .rev()
        .filter(|e| e.event_type != "m.room.redaction")
        .cloned()
        .collect();
    if !fresh.is_empty() {
        room.new_events = fresh;
    }
}

fn update_unread(room: &mut RoomSummary, fragment: &RoomFragment) {
    if let Some(unread) = &fragment.unread_notifications {
        room.unread_count = unread.notification_count;
    }
}

/// 房间列表存储
pub struct RoomListStore {
    own_user_id: Option<String>,
    timeline_capacity: usize,
    state: RwLock<RoomListState>,
    sync_complete: AtomicBool,
}

impl RoomListStore {
    pub fn new(own_user_id: Option<String>) -> Self {
        Self {
            own_user_id,
            timeline_capacity: DEFAULT_TIMELINE_CAPACITY,
            state: RwLock::new(RoomListState::new(DEFAULT_TIMELINE_CAPACITY)),
            sync_complete: AtomicBool::new(false),
        }
    }

    pub fn with_timeline_capacity(mut self, capacity: usize) -> Self {
        self.timeline_capacity = capacity.max(1);
        self.state.get_mut().timeline_capacity = self.timeline_capacity;
        self
    }

    /// 首次同步：整体重建
    fn build(&self, delta: &Delta) {
        let now = Utc::now().timestamp_millis();
        let own = self.own_user_id.as_deref();
        let mut state = self.state.write();
        state.rooms.clear();
        state.set_direct_rooms(&delta.account_data.events);

        if let Some(rooms) = &delta.rooms {
            for (room_id, fragment) in &rooms.invite {
                let mut room = RoomSummary::new(room_id, RoomPhase::Invite);
                self.setup_room(&mut state, &mut room, fragment, &fragment.invite_state.events, own);
                state.rooms.insert(room_id.clone(), room);
            }
            for (room_id, fragment) in &rooms.join {
                let mut room = RoomSummary::new(room_id, RoomPhase::Join);
                self.setup_room(&mut state, &mut room, fragment, &fragment.state.events, own);
                RoomListState::update_active(&mut room);

                // 带 timeline 的首次同步（完整同步）顺便填充消息
                if !fragment.timeline.events.is_empty() {
                    update_timeline(&mut room, &fragment.timeline, self.timeline_capacity);
                    update_new_events(&mut room, &fragment.timeline);
                    if !room.is_community() {
                        state.apply_receipts(&mut room, &fragment.ephemeral.events);
                        state.presence_from_timeline(&room);
                        update_unread(&mut room, fragment);
                    }
                }
                state.rooms.insert(room_id.clone(), room);
            }
        }
        state.apply_presence(&delta.presence.events, now);
        info!(rooms = state.rooms.len(), "房间列表已重建");
    }

    fn setup_room(
        &self,
        state: &mut RoomListState,
        room: &mut RoomSummary,
        fragment: &RoomFragment,
        state_events: &[ClientEvent],
        own: Option<&str>,
    ) {
        state.apply_events(room, state_events);
        RoomListState::apply_summary(room, &fragment.summary);
        state.set_room_type(room, true);
        if room.room_type == Some(RoomType::Direct) {
            state.set_contact_id(room, own);
        }
        if room.is_community() && room.name.is_none() {
            room.name = room.alias.clone();
        }
    }

    /// 增量同步：打补丁
    fn patch(&self, delta: &Delta) {
        let now = Utc::now().timestamp_millis();
        let own = self.own_user_id.as_deref();
        let capacity = self.timeline_capacity;
        let mut state = self.state.write();
        state.set_direct_rooms(&delta.account_data.events);

        if let Some(rooms) = &delta.rooms {
            for (room_id, fragment) in &rooms.join {
                let existing = state.rooms.remove(room_id);
                let room = match existing {
                    Some(mut room) if room.phase == RoomPhase::Join && room.room_type.is_some() => {
                        update_timeline(&mut room, &fragment.timeline, capacity);
                        update_new_events(&mut room, &fragment.timeline);
                        let had_members = room.members.len();
                        state.apply_events(&mut room, &fragment.timeline.events);
                        state.apply_events(&mut room, &fragment.state.events);
                        let member_event = fragment
                            .timeline
                            .events
                            .iter()
                            .chain(fragment.state.events.iter())
                            .any(|e| e.event_type == "m.room.member")
                            || room.members.len() != had_members;
                        if !room.is_community() {
                            if member_event {
                                RoomListState::apply_summary(&mut room, &fragment.summary);
                                RoomListState::update_active(&mut room);
                            }
                            state.apply_receipts(&mut room, &fragment.ephemeral.events);
                            update_unread(&mut room, fragment);
                        }
                        room
                    }
                    Some(mut room) if room.phase == RoomPhase::Invite => {
                        // 邀请已接受
                        update_timeline(&mut room, &fragment.timeline, capacity);
                        update_new_events(&mut room, &fragment.timeline);
                        RoomListState::apply_summary(&mut room, &fragment.summary);
                        state.apply_events(&mut room, &fragment.timeline.events);
                        room.phase = RoomPhase::Join;
                        room.unread_count = 0;
                        room.active = true;
                        debug!(room_id = %room_id, "邀请已接受");
                        room
                    }
                    // 重新加入的房间按新房间处理
                    Some(RoomSummary { phase: RoomPhase::Leave, .. }) | None => {
                        self.initialise_join(&mut state, room_id, fragment, None)
                    }
                    Some(room) => self.initialise_join(&mut state, room_id, fragment, Some(room)),
                };
                state.rooms.insert(room_id.clone(), room);
            }

            for (room_id, fragment) in &rooms.invite {
                if !state.rooms.contains_key(room_id) {
                    let mut room = RoomSummary::new(room_id, RoomPhase::Invite);
                    self.setup_room(&mut state, &mut room, fragment, &fragment.invite_state.events, own);
                    state.rooms.insert(room_id.clone(), room);
                }
            }

            for room_id in rooms.leave.keys() {
                if let Some(room) = state.rooms.get_mut(room_id) {
                    room.phase = RoomPhase::Leave;
                }
            }
        }

        state.apply_presence(&delta.presence.events, now);
    }

    /// 新加入（或类型尚未确定）的房间
    fn initialise_join(
        &self,
        state: &mut RoomListState,
        room_id: &str,
        fragment: &RoomFragment,
        existing: Option<RoomSummary>,
    ) -> RoomSummary {
        let mut room = existing.unwrap_or_else(|| RoomSummary::new(room_id, RoomPhase::Join));
        RoomListState::apply_summary(&mut room, &fragment.summary);
        state.apply_events(&mut room, &fragment.state.events);
        state.apply_events(&mut room, &fragment.timeline.events);
        state.set_room_type(&mut room, false);
        update_timeline(&mut room, &fragment.timeline, self.timeline_capacity);
        update_new_events(&mut room, &fragment.timeline);

        if room.room_type.is_some() {
            if room.room_type == Some(RoomType::Direct) {
                state.set_contact_id(&mut room, self.own_user_id.as_deref());
            }
            RoomListState::update_active(&mut room);
        }
        room
    }

    /// 可展示的房间：排除已离开和类型未定的，invite 在前，再按未读数、最新活动排序
    pub fn sorted_rooms(&self) -> Vec<RoomSummary> {
        let state = self.state.read();
        let mut rooms: Vec<RoomSummary> = state
            .rooms
            .values()
            .filter(|r| r.phase != RoomPhase::Leave && r.room_type.is_some())
            .cloned()
            .collect();
        rooms.sort_by(|a, b| {
            a.phase
                .cmp(&b.phase)
                .then(b.unread_count.cmp(&a.unread_count))
                .then(b.latest_activity().cmp(&a.latest_activity()))
                .then(a.id.cmp(&b.id))
        });
        rooms
    }

    pub fn room(&self, room_id: &str) -> Option<RoomSummary> {
        self.state.read().rooms.get(room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.state.read().rooms.len()
    }

    /// 用户最后活跃时间，未知时为 0
    pub fn last_seen(&self, user_id: &str) -> i64 {
        self.state.read().last_seen.get(user_id).copied().unwrap_or(0)
    }

    pub fn direct_contact(&self, room_id: &str) -> Option<String> {
        self.state.read().direct_rooms.get(room_id).cloned()
    }

    pub fn unread_total(&self) -> u64 {
        self.state
            .read()
            .rooms
            .values()
            .filter(|r| r.phase != RoomPhase::Leave)
            .map(|r| r.unread_count)
            .sum()
    }

    pub fn is_sync_complete(&self) -> bool {
        self.sync_complete.load(Ordering::SeqCst)
    }

    /// 登出时清空
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = RoomListState::new(self.timeline_capacity);
        self.sync_complete.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeltaConsumer for RoomListStore {
    async fn apply_initial(&self, delta: Delta) -> Result<()> {
        self.build(&delta);
        Ok(())
    }

    async fn apply_incremental(&self, delta: Delta) -> Result<()> {
        self.patch(&delta);
        Ok(())
    }

    async fn set_sync_complete(&self, complete: bool) {
        if self.sync_complete.swap(complete, Ordering::SeqCst) != complete {
            debug!(complete, "同步完成标记变化");
        }
    }
}
