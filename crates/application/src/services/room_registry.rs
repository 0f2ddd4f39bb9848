//! 房间注册表
//!
//! 房间创建经过按名互斥锁串行化：验证 → 名字缓存 → 持久化 →
//! 回填缓存 → 发布 `room:created`。加入/离开维护成员数、成员关系
//! 与共享在线集合，并在房间事件频道上发布。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{ChatRoom, DomainError, RepositoryError, RoomId, RoomName, User, UserId};
use tokio::sync::Mutex;

use crate::bus::{channels, Bus, BusEnvelope, BusEvent};
use crate::cache::{keys, LayeredCache, DEFAULT_TTL};
use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::presence::PresenceStore;
use crate::repository::{MemberRepository, RoomRepository, UserRepository};
use crate::typing::{TypingTracker, TYPING_TTL};

/// 名字缓存条目的存活时间；成员数变化频繁，保持短一些。
const NAME_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct RoomRegistryDependencies {
    pub rooms: Arc<dyn RoomRepository>,
    pub members: Arc<dyn MemberRepository>,
    pub users: Arc<dyn UserRepository>,
    pub presence: Arc<dyn PresenceStore>,
    pub cache: Arc<LayeredCache>,
    pub bus: Arc<dyn Bus>,
    pub clock: Arc<dyn Clock>,
    pub typing: Arc<TypingTracker>,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: ChatRoom,
    pub member_count: u32,
    pub members: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub room: ChatRoom,
    pub member_count: u32,
}

pub struct RoomRegistry {
    deps: RoomRegistryDependencies,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RoomRegistry {
    pub fn new(deps: RoomRegistryDependencies) -> Self {
        Self {
            deps,
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn name_lock(&self, name: &RoomName) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        locks
            .entry(name.as_str().to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 创建房间；名字冲突返回 `DomainError::RoomExists`。
    pub async fn create(&self, raw_name: &str, creator: &User) -> ApplicationResult<ChatRoom> {
        let name = RoomName::parse(raw_name)?;
        let lock = self.name_lock(&name).await;
        let _guard = lock.lock().await;

        let name_key = keys::room_name(&name);
        if self.deps.cache.get(&name_key).await.is_some() {
            return Err(DomainError::room_exists(name.as_str()).into());
        }
        if self.deps.rooms.find_by_name_active(&name).await?.is_some() {
            return Err(DomainError::room_exists(name.as_str()).into());
        }

        let now = self.deps.clock.now();
        let room = ChatRoom::new(RoomId::random(), name.clone(), creator.id, now);
        let room = match self.deps.rooms.create(room).await {
            Ok(room) => room,
            Err(RepositoryError::Conflict) => {
                return Err(DomainError::room_exists(name.as_str()).into());
            }
            Err(err) => return Err(err.into()),
        };

        self.cache_room(&room).await;
        self.deps.cache.invalidate(keys::ACTIVE_ROOMS, false).await;

        self.publish(
            channels::ROOM_CREATED,
            BusEnvelope::new(BusEvent::RoomCreated {
                room_id: room.id,
                name: room.name.as_str().to_owned(),
            }),
        )
        .await;

        tracing::info!(room_id = %room.id, name = %room.name, creator = %creator.id, "房间已创建");
        Ok(room)
    }

    /// 名字解析：名字缓存 → 持久化；不存在或已停用时报 `RoomNotFound`。
    pub async fn resolve(&self, raw_name: &str) -> ApplicationResult<ChatRoom> {
        let name =
            RoomName::parse(raw_name).map_err(|_| DomainError::room_not_found(raw_name))?;
        let name_key = keys::room_name(&name);

        if let Some(value) = self.deps.cache.get(&name_key).await {
            if let Ok(room) = serde_json::from_value::<ChatRoom>(value) {
                if room.is_active {
                    return Ok(room);
                }
            }
        }

        match self.deps.rooms.find_by_name_active(&name).await? {
            Some(room) => {
                self.cache_room(&room).await;
                Ok(room)
            }
            None => Err(DomainError::room_not_found(name.as_str()).into()),
        }
    }

    pub async fn join(&self, raw_name: &str, user: &User) -> ApplicationResult<JoinOutcome> {
        let room = self.resolve(raw_name).await?;
        let now = self.deps.clock.now();

        // 已是活跃成员（多设备重复加入）：不动任何计数
        if self
            .deps
            .members
            .active_rooms_of(user.id)
            .await?
            .contains(&room.id)
        {
            let members = self.member_list(room.id).await;
            let member_count = room.current_users;
            return Ok(JoinOutcome {
                room,
                member_count,
                members,
            });
        }

        let member = self
            .deps
            .members
            .join(room.id, user.id, &user.username, now)
            .await?;
        if member.join_count == 1 {
            if let Err(err) = self.deps.rooms.record_unique_user(room.id).await {
                tracing::warn!(room_id = %room.id, error = %err, "unique-user counter update failed");
            }
        }

        self.deps.users.update_room(user.id, Some(&room.name)).await?;
        let member_count = self
            .deps
            .rooms
            .adjust_user_count(room.id, 1, now)
            .await?;

        if let Err(err) = self.deps.presence.add_member(room.id, user.id).await {
            tracing::warn!(room_id = %room.id, error = %err, "presence add failed");
        }

        // 成员数变了，名字缓存里的快照随之过时
        self.deps.cache.invalidate(&keys::room_name(&room.name), false).await;

        self.publish(
            &channels::room_events(room.id),
            BusEnvelope::excluding(
                BusEvent::UserJoined {
                    room_id: room.id,
                    user_id: user.id,
                    username: user.username.as_str().to_owned(),
                    member_count,
                },
                user.id,
            ),
        )
        .await;

        let members = self.member_list(room.id).await;
        tracing::info!(room_id = %room.id, user_id = %user.id, member_count, "用户加入房间");

        let mut room = room;
        room.current_users = member_count;
        Ok(JoinOutcome {
            room,
            member_count,
            members,
        })
    }

    pub async fn leave(&self, room_id: RoomId, user: &User) -> ApplicationResult<LeaveOutcome> {
        let room = self
            .deps
            .rooms
            .find_by_id(room_id)
            .await?
            .ok_or_else(|| DomainError::room_not_found(room_id.to_string()))?;
        let now = self.deps.clock.now();

        self.deps.members.leave(room.id, user.id, now).await?;
        self.deps.users.update_room(user.id, None).await?;
        let member_count = self
            .deps
            .rooms
            .adjust_user_count(room.id, -1, now)
            .await?;

        if let Err(err) = self.deps.presence.remove_member(room.id, user.id).await {
            tracing::warn!(room_id = %room.id, error = %err, "presence remove failed");
        }
        if let Some(typing) = self.deps.typing.stop(room.id, user.id).await {
            self.publish_typing(room.id, typing).await;
        }

        self.deps.cache.invalidate(&keys::room_name(&room.name), false).await;

        if member_count == 0 {
            // 房间空置停用：丢掉以它为锚的所有缓存条目
            self.deps.cache.invalidate(&keys::room(room.id), true).await;
            self.deps.typing.clear_room(room.id).await;
            if let Err(err) = self.deps.presence.clear_room(room.id).await {
                tracing::warn!(room_id = %room.id, error = %err, "presence clear failed");
            }
            tracing::info!(room_id = %room.id, name = %room.name, "房间已清空并停用");
        }

        self.publish(
            &channels::room_events(room.id),
            BusEnvelope::excluding(
                BusEvent::UserLeft {
                    room_id: room.id,
                    user_id: user.id,
                    username: user.username.as_str().to_owned(),
                    member_count,
                },
                user.id,
            ),
        )
        .await;

        Ok(LeaveOutcome { room, member_count })
    }

    /// 断连清理：离开用户的所有活跃房间，返回房间名列表。
    pub async fn leave_all(&self, user: &User) -> Vec<RoomName> {
        let room_ids = match self.deps.members.active_rooms_of(user.id).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(user_id = %user.id, error = %err, "active rooms lookup failed");
                return Vec::new();
            }
        };

        let mut left = Vec::new();
        for room_id in room_ids {
            match self.leave(room_id, user).await {
                Ok(outcome) => left.push(outcome.room.name.clone()),
                Err(err) => {
                    tracing::warn!(room_id = %room_id, user_id = %user.id, error = %err, "leave on disconnect failed");
                }
            }
        }
        left
    }

    /// 输入指示。`is_typing = false` 时集合里不存在也不是错误。
    pub async fn typing(&self, room_id: RoomId, user: &User, is_typing: bool) {
        if is_typing {
            let (names, generation) = self
                .deps
                .typing
                .start(room_id, user.id, user.username.as_str())
                .await;
            self.publish_typing(room_id, names).await;
            self.schedule_typing_expiry(room_id, user.id, generation);
        } else if let Some(names) = self.deps.typing.stop(room_id, user.id).await {
            self.publish_typing(room_id, names).await;
        }
    }

    fn schedule_typing_expiry(&self, room_id: RoomId, user_id: UserId, generation: u64) {
        let typing = self.deps.typing.clone();
        let bus = self.deps.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TYPING_TTL).await;
            if let Some(names) = typing.expire(room_id, user_id, generation).await {
                let envelope = BusEnvelope::new(BusEvent::TypingUpdate {
                    room_id,
                    typing_users: names,
                });
                if let Err(err) = bus.publish(&channels::room_events(room_id), envelope).await {
                    tracing::debug!(room_id = %room_id, error = %err, "typing expiry publish failed");
                }
            }
        });
    }

    async fn publish_typing(&self, room_id: RoomId, typing_users: Vec<String>) {
        self.publish(
            &channels::room_events(room_id),
            BusEnvelope::new(BusEvent::TypingUpdate {
                room_id,
                typing_users,
            }),
        )
        .await;
    }

    /// 成员名单：优先共享在线集合（经存储翻译成用户名），
    /// 失败或为空时回退到活跃成员关系。
    pub async fn member_list(&self, room_id: RoomId) -> Vec<String> {
        if let Ok(ids) = self.deps.presence.members(room_id).await {
            if !ids.is_empty() {
                let mut names = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.deps.users.find_by_id(id).await {
                        Ok(Some(user)) => names.push(user.username.as_str().to_owned()),
                        Ok(None) => {}
                        Err(err) => {
                            tracing::debug!(user_id = %id, error = %err, "member name lookup failed");
                        }
                    }
                }
                if !names.is_empty() {
                    names.sort();
                    return names;
                }
            }
        }

        match self.deps.members.active_members(room_id).await {
            Ok(members) => {
                let mut names: Vec<String> = members
                    .into_iter()
                    .map(|m| m.username.as_str().to_owned())
                    .collect();
                names.sort();
                names
            }
            Err(err) => {
                tracing::warn!(room_id = %room_id, error = %err, "member list fallback failed");
                Vec::new()
            }
        }
    }

    /// 活跃房间列表（`rooms` 命令），读穿缓存。
    pub async fn list_active(&self, limit: u32) -> ApplicationResult<Vec<ChatRoom>> {
        let rooms = self.deps.rooms.clone();
        let value = self
            .deps
            .cache
            .get_or_load(keys::ACTIVE_ROOMS, DEFAULT_TTL, &[], || async move {
                let active = rooms.find_active(limit).await.map_err(ApplicationError::from)?;
                serde_json::to_value(active)
                    .map_err(|e| ApplicationError::infrastructure_with_source("serialize rooms", e))
            })
            .await?;
        let rooms: Vec<ChatRoom> = serde_json::from_value(value)
            .map_err(|e| ApplicationError::infrastructure_with_source("decode cached rooms", e))?;
        Ok(rooms.into_iter().take(limit as usize).collect())
    }

    async fn cache_room(&self, room: &ChatRoom) {
        if let Ok(value) = serde_json::to_value(room) {
            self.deps
                .cache
                .set(
                    &keys::room_name(&room.name),
                    value,
                    NAME_CACHE_TTL,
                    &[keys::room(room.id)],
                )
                .await;
        }
    }

    async fn publish(&self, channel: &str, envelope: BusEnvelope) {
        if let Err(err) = self.deps.bus.publish(channel, envelope).await {
            // 总线失败不影响本地结果；熔断层已经做了降级
            tracing::debug!(channel, error = %err, "bus publish failed");
        }
    }
}
