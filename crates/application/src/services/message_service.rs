//! 消息处理服务
//!
//! 发送管线：验证 → 净化 → 垃圾评分 → 持久化（含计数器）→
//! 失效缓存 → 发布 → 取消发送者的输入指示。
//! 历史读取走缓存，按时间正序返回。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{
    sanitize, DomainError, Message, MessageId, MessageKind, RoomId, Timestamp, User, UserId,
};
use tokio::sync::Mutex;

use crate::bus::{channels, Bus, BusEnvelope, BusEvent};
use crate::cache::{keys, LayeredCache, DEFAULT_TTL};
use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::repository::{
    MemberRepository, MessageRepository, RoomMessageStats, RoomRepository, UserRepository,
};
use crate::typing::TypingTracker;

/// 发送后允许编辑/删除的窗口。
pub const EDIT_WINDOW: time::Duration = time::Duration::minutes(5);
/// 历史查询的默认条数。
pub const HISTORY_LIMIT: u32 = 20;

pub struct MessageServiceDependencies {
    pub messages: Arc<dyn MessageRepository>,
    pub rooms: Arc<dyn RoomRepository>,
    pub members: Arc<dyn MemberRepository>,
    pub users: Arc<dyn UserRepository>,
    pub cache: Arc<LayeredCache>,
    pub bus: Arc<dyn Bus>,
    pub clock: Arc<dyn Clock>,
    pub typing: Arc<TypingTracker>,
}

pub struct MessageService {
    deps: MessageServiceDependencies,
    /// 每房间最后分配的时间戳，保证单调。
    last_timestamps: Mutex<HashMap<RoomId, Timestamp>>,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self {
            deps,
            last_timestamps: Mutex::new(HashMap::new()),
        }
    }

    /// 服务端分配的时间戳，按房间单调递增。
    async fn next_timestamp(&self, room_id: RoomId) -> Timestamp {
        let now = self.deps.clock.now();
        let mut last = self.last_timestamps.lock().await;
        let ts = match last.get(&room_id) {
            Some(prev) if now <= *prev => *prev + time::Duration::microseconds(1),
            _ => now,
        };
        last.insert(room_id, ts);
        ts
    }

    pub async fn send(
        &self,
        room_id: RoomId,
        user: &User,
        raw_content: &str,
    ) -> ApplicationResult<Message> {
        let content = sanitize::clean_content(raw_content)?;

        let recent = self.history(room_id, HISTORY_LIMIT).await;
        let recent_contents: Vec<String> = recent.iter().map(|m| m.content.clone()).collect();
        let verdict = sanitize::spam_score(&content, &recent_contents);
        if verdict.is_spam {
            tracing::warn!(user_id = %user.id, room_id = %room_id, score = verdict.score, "消息被垃圾评分拦截");
            return Err(DomainError::content_rejected("message flagged as spam").into());
        }

        let timestamp = self.next_timestamp(room_id).await;
        let message = Message::new_user(
            MessageId::random(),
            room_id,
            user.id,
            user.username.as_str(),
            content,
            timestamp,
        );

        let message = self.deps.messages.create(message).await?;

        // 计数器属于增量维护，失败降级为日志
        if let Err(err) = self.deps.rooms.record_message(room_id, timestamp).await {
            tracing::warn!(room_id = %room_id, error = %err, "room counter update failed");
        }
        if let Err(err) = self
            .deps
            .members
            .record_message(room_id, user.id, timestamp)
            .await
        {
            tracing::warn!(room_id = %room_id, error = %err, "membership counter update failed");
        }
        if let Err(err) = self.deps.users.record_message(user.id, timestamp).await {
            tracing::warn!(user_id = %user.id, error = %err, "user counter update failed");
        }

        self.deps
            .cache
            .invalidate(&keys::room_messages(room_id), false)
            .await;

        self.publish(
            &channels::room_messages(room_id),
            BusEnvelope::excluding(
                BusEvent::Message {
                    message: message.clone(),
                },
                user.id,
            ),
        )
        .await;

        if let Some(names) = self.deps.typing.stop(room_id, user.id).await {
            self.publish(
                &channels::room_events(room_id),
                BusEnvelope::new(BusEvent::TypingUpdate {
                    room_id,
                    typing_users: names,
                }),
            )
            .await;
        }

        Ok(message)
    }

    /// 房间历史，按时间正序；存储故障时降级为空列表。
    pub async fn history(&self, room_id: RoomId, limit: u32) -> Vec<Message> {
        let messages = self.deps.messages.clone();
        let anchor = keys::room(room_id);
        let result = self
            .deps
            .cache
            .get_or_load(
                &keys::room_messages(room_id),
                DEFAULT_TTL,
                std::slice::from_ref(&anchor),
                || async move {
                    let mut recent = messages
                        .history(room_id, limit, None)
                        .await
                        .map_err(ApplicationError::from)?;
                    recent.reverse();
                    serde_json::to_value(recent).map_err(|e| {
                        ApplicationError::infrastructure_with_source("serialize history", e)
                    })
                },
            )
            .await;

        match result {
            Ok(value) => serde_json::from_value(value).unwrap_or_default(),
            Err(err) => {
                tracing::warn!(room_id = %room_id, error = %err, "history unavailable, serving empty");
                Vec::new()
            }
        }
    }

    /// 系统消息：`notification` 持久化，`system` 只做扇出。
    pub async fn system_broadcast(
        &self,
        room_id: RoomId,
        content: &str,
        kind: MessageKind,
    ) -> ApplicationResult<Message> {
        let timestamp = self.next_timestamp(room_id).await;
        let message = Message::synthetic(room_id, content, kind, timestamp);

        if kind == MessageKind::Notification {
            if let Err(err) = self.deps.messages.create(message.clone()).await {
                tracing::warn!(room_id = %room_id, error = %err, "notification persistence failed");
            } else {
                self.deps
                    .cache
                    .invalidate(&keys::room_messages(room_id), false)
                    .await;
            }
        }

        self.publish(
            &channels::room_messages(room_id),
            BusEnvelope::new(BusEvent::Message {
                message: message.clone(),
            }),
        )
        .await;

        Ok(message)
    }

    /// 编辑：仅限作者、发送后 5 分钟内。
    pub async fn edit(
        &self,
        message_id: MessageId,
        editor: &User,
        raw_content: &str,
    ) -> ApplicationResult<Message> {
        let message = self
            .deps
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| DomainError::not_allowed("edit: message not found"))?;

        self.check_owner_window(&message, editor, "edit")?;
        let content = sanitize::clean_content(raw_content)?;
        let now = self.deps.clock.now();

        let updated = self
            .deps
            .messages
            .update_content(message_id, &content, now)
            .await?;

        self.deps
            .cache
            .invalidate(&keys::room_messages(message.room_id), false)
            .await;
        self.publish(
            &channels::room_events(message.room_id),
            BusEnvelope::new(BusEvent::MessageEdited {
                message: updated.clone(),
            }),
        )
        .await;

        Ok(updated)
    }

    /// 删除：仅限作者、发送后 5 分钟内。
    pub async fn delete(&self, message_id: MessageId, user: &User) -> ApplicationResult<()> {
        let message = self
            .deps
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| DomainError::not_allowed("delete: message not found"))?;

        self.check_owner_window(&message, user, "delete")?;
        self.deps.messages.delete(message_id).await?;

        self.deps
            .cache
            .invalidate(&keys::room_messages(message.room_id), false)
            .await;
        self.publish(
            &channels::room_events(message.room_id),
            BusEnvelope::new(BusEvent::MessageDeleted {
                room_id: message.room_id,
                message_id,
            }),
        )
        .await;

        Ok(())
    }

    fn check_owner_window(
        &self,
        message: &Message,
        user: &User,
        action: &str,
    ) -> Result<(), DomainError> {
        if message.user_id != user.id {
            return Err(DomainError::not_allowed(format!("{action}: not the author")));
        }
        let now = self.deps.clock.now();
        if now - message.timestamp > EDIT_WINDOW {
            return Err(DomainError::not_allowed(format!("{action}: window elapsed")));
        }
        Ok(())
    }

    pub async fn room_stats(
        &self,
        room_id: RoomId,
        hours_back: u32,
    ) -> ApplicationResult<RoomMessageStats> {
        Ok(self.deps.messages.room_stats(room_id, hours_back).await?)
    }

    /// 用户最近的一条消息（`me` 命令用），故障时静默为空。
    pub async fn last_message_of(&self, user_id: UserId) -> Option<Message> {
        match self.deps.messages.by_user(user_id, 1).await {
            Ok(mut recent) => recent.pop(),
            Err(err) => {
                tracing::debug!(user_id = %user_id, error = %err, "recent message lookup failed");
                None
            }
        }
    }

    async fn publish(&self, channel: &str, envelope: BusEnvelope) {
        if let Err(err) = self.deps.bus.publish(channel, envelope).await {
            tracing::debug!(channel, error = %err, "bus publish failed");
        }
    }
}
