//! Postgres 存储实现
//!
//! 记录结构体经 `TryFrom` 转回领域类型；唯一约束冲突（23505）
//! 映射为 `RepositoryError::Conflict`，由上层翻译成 ROOM_EXISTS。

use std::sync::Arc;

use application::repository::{
    MemberRepository, MessageRepository, RoomMessageStats, RoomRepository, UserRepository,
};
use async_trait::async_trait;
use domain::{
    ChatRoom, Message, MessageId, MessageKind, RepositoryError, RoomId, RoomMember, RoomName,
    Timestamp, User, UserId, Username,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// 连接获取超时（池内等待）。
const ACQUIRE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub async fn create_pg_pool(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(url)
        .await
}

pub fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(ref db_err) if db_err.code().is_some_and(|code| code == "23505") => {
            RepositoryError::Conflict
        }
        other => {
            let message = other.to_string();
            RepositoryError::storage_with_source(message, other)
        }
    }
}

fn invalid_data<E>(error: E) -> RepositoryError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RepositoryError::storage_with_source(error.to_string(), error)
}

fn kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::User => "user",
        MessageKind::System => "system",
        MessageKind::Notification => "notification",
    }
}

fn kind_from_str(raw: &str) -> MessageKind {
    match raw {
        "system" => MessageKind::System,
        "notification" => MessageKind::Notification,
        _ => MessageKind::User,
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub users: Arc<PgUserRepository>,
    pub rooms: Arc<PgRoomRepository>,
    pub members: Arc<PgMemberRepository>,
    pub messages: Arc<PgMessageRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            users: Arc::new(PgUserRepository::new(pool.clone())),
            rooms: Arc::new(PgRoomRepository::new(pool.clone())),
            members: Arc::new(PgMemberRepository::new(pool.clone())),
            messages: Arc::new(PgMessageRepository::new(pool)),
        }
    }
}

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    username: String,
    created_at: OffsetDateTime,
    last_seen: OffsetDateTime,
    is_online: bool,
    current_room: Option<String>,
    total_messages: i64,
    connection_count: i32,
    rooms_joined: Vec<String>,
}

impl TryFrom<UserRecord> for User {
    type Error = RepositoryError;

    fn try_from(value: UserRecord) -> Result<Self, Self::Error> {
        let username = Username::parse(value.username).map_err(invalid_data)?;
        let current_room = value
            .current_room
            .map(RoomName::parse)
            .transpose()
            .map_err(invalid_data)?;
        Ok(User {
            id: UserId::from(value.id),
            username,
            created_at: value.created_at,
            last_seen: value.last_seen,
            is_online: value.is_online,
            current_room,
            total_messages: value.total_messages.max(0) as u64,
            connection_count: value.connection_count.max(0) as u32,
            rooms_joined: value.rooms_joined,
        })
    }
}

const USER_COLUMNS: &str = "id, username, created_at, last_seen, is_online, current_room, \
     total_messages, connection_count, rooms_joined";

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (id, username, created_at, last_seen, is_online, current_room, \
                                total_messages, connection_count, rooms_joined) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET last_seen = EXCLUDED.last_seen \
             RETURNING id, username, created_at, last_seen, is_online, current_room, \
                       total_messages, connection_count, rooms_joined",
        )
        .bind(Uuid::from(user.id))
        .bind(user.username.as_str())
        .bind(user.created_at)
        .bind(user.last_seen)
        .bind(user.is_online)
        .bind(user.current_room.as_ref().map(|r| r.as_str()))
        .bind(user.total_messages as i64)
        .bind(user.connection_count as i32)
        .bind(&user.rooms_joined)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        User::try_from(record)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(User::try_from).transpose()
    }

    async fn find_by_username_online(
        &self,
        username: &Username,
    ) -> Result<Option<User>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 AND is_online"
        ))
        .bind(username.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(User::try_from).transpose()
    }

    async fn set_online(
        &self,
        id: UserId,
        online: bool,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE users SET is_online = $2, last_seen = $3, \
                 current_room = CASE WHEN $2 THEN current_room ELSE NULL END, \
                 connection_count = CASE WHEN $2 THEN connection_count ELSE 0 END \
             WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .bind(online)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn update_room(
        &self,
        id: UserId,
        room: Option<&RoomName>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE users SET current_room = $2, \
                 rooms_joined = CASE \
                     WHEN $2 IS NULL OR $2 = ANY(rooms_joined) THEN rooms_joined \
                     WHEN COALESCE(array_length(rooms_joined, 1), 0) >= 50 \
                         THEN array_append(rooms_joined[2:], $2) \
                     ELSE array_append(rooms_joined, $2) \
                 END \
             WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .bind(room.map(|r| r.as_str()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn adjust_connections(&self, id: UserId, delta: i32) -> Result<u32, RepositoryError> {
        let row = sqlx::query(
            "UPDATE users SET connection_count = GREATEST(connection_count + $2, 0) \
             WHERE id = $1 RETURNING connection_count",
        )
        .bind(Uuid::from(id))
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        let count: i32 = row.try_get("connection_count").map_err(map_sqlx_err)?;
        Ok(count.max(0) as u32)
    }

    async fn record_message(&self, id: UserId, at: Timestamp) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE users SET total_messages = total_messages + 1, last_seen = $2 WHERE id = $1")
            .bind(Uuid::from(id))
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn online_users(&self) -> Result<Vec<User>, RepositoryError> {
        let records = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE is_online ORDER BY username"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        records.into_iter().map(User::try_from).collect()
    }

    async fn purge_inactive(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM users WHERE NOT is_online AND last_seen < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: Uuid,
    name: String,
    created_by: Uuid,
    created_at: OffsetDateTime,
    last_activity: OffsetDateTime,
    is_active: bool,
    current_users: i32,
    peak_users: i32,
    message_count: i64,
    total_unique_users: i32,
}

impl TryFrom<RoomRecord> for ChatRoom {
    type Error = RepositoryError;

    fn try_from(value: RoomRecord) -> Result<Self, Self::Error> {
        Ok(ChatRoom {
            id: RoomId::from(value.id),
            name: RoomName::parse(value.name).map_err(invalid_data)?,
            created_by: UserId::from(value.created_by),
            created_at: value.created_at,
            last_activity: value.last_activity,
            is_active: value.is_active,
            current_users: value.current_users.max(0) as u32,
            peak_users: value.peak_users.max(0) as u32,
            message_count: value.message_count.max(0) as u64,
            total_unique_users: value.total_unique_users.max(0) as u32,
        })
    }
}

const ROOM_COLUMNS: &str = "id, name, created_by, created_at, last_activity, is_active, \
     current_users, peak_users, message_count, total_unique_users";

#[derive(Clone)]
pub struct PgRoomRepository {
    pool: PgPool,
}

impl PgRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomRepository for PgRoomRepository {
    async fn create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError> {
        // 同名活跃房间冲突；空置停用的同名房间被重新创建复活
        let record = sqlx::query_as::<_, RoomRecord>(
            "INSERT INTO rooms (id, name, created_by, created_at, last_activity, is_active, \
                                current_users, peak_users, message_count, total_unique_users) \
             VALUES ($1, $2, $3, $4, $5, TRUE, 0, 0, 0, 0) \
             ON CONFLICT (name) DO UPDATE \
                 SET is_active = TRUE, last_activity = EXCLUDED.last_activity \
                 WHERE rooms.is_active = FALSE \
             RETURNING id, name, created_by, created_at, last_activity, is_active, \
                       current_users, peak_users, message_count, total_unique_users",
        )
        .bind(Uuid::from(room.id))
        .bind(room.name.as_str())
        .bind(Uuid::from(room.created_by))
        .bind(room.created_at)
        .bind(room.last_activity)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => ChatRoom::try_from(record),
            // DO UPDATE 条件不满足：存在同名活跃房间
            None => Err(RepositoryError::Conflict),
        }
    }

    async fn find_by_id(&self, id: RoomId) -> Result<Option<ChatRoom>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(ChatRoom::try_from).transpose()
    }

    async fn find_by_name_active(
        &self,
        name: &RoomName,
    ) -> Result<Option<ChatRoom>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE name = $1 AND is_active"
        ))
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(ChatRoom::try_from).transpose()
    }

    async fn find_active(&self, limit: u32) -> Result<Vec<ChatRoom>, RepositoryError> {
        let records = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE is_active \
             ORDER BY last_activity DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        records.into_iter().map(ChatRoom::try_from).collect()
    }

    async fn adjust_user_count(
        &self,
        id: RoomId,
        delta: i32,
        at: Timestamp,
    ) -> Result<u32, RepositoryError> {
        let row = sqlx::query(
            "UPDATE rooms SET \
                 current_users = GREATEST(current_users + $2, 0), \
                 peak_users = GREATEST(peak_users, GREATEST(current_users + $2, 0)), \
                 is_active = GREATEST(current_users + $2, 0) > 0, \
                 last_activity = $3 \
             WHERE id = $1 RETURNING current_users",
        )
        .bind(Uuid::from(id))
        .bind(delta)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        let count: i32 = row.try_get("current_users").map_err(map_sqlx_err)?;
        Ok(count.max(0) as u32)
    }

    async fn record_message(&self, id: RoomId, at: Timestamp) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE rooms SET message_count = message_count + 1, last_activity = $2 WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn record_unique_user(&self, id: RoomId) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE rooms SET total_unique_users = total_unique_users + 1 WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn cleanup_empty(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM rooms WHERE NOT is_active AND last_activity < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct MemberRecord {
    room_id: Uuid,
    user_id: Uuid,
    username: String,
    joined_at: OffsetDateTime,
    left_at: Option<OffsetDateTime>,
    is_active: bool,
    messages_in_room: i64,
    join_count: i32,
    last_message_at: Option<OffsetDateTime>,
}

impl TryFrom<MemberRecord> for RoomMember {
    type Error = RepositoryError;

    fn try_from(value: MemberRecord) -> Result<Self, Self::Error> {
        Ok(RoomMember {
            room_id: RoomId::from(value.room_id),
            user_id: UserId::from(value.user_id),
            username: Username::parse(value.username).map_err(invalid_data)?,
            joined_at: value.joined_at,
            left_at: value.left_at,
            is_active: value.is_active,
            messages_in_room: value.messages_in_room.max(0) as u64,
            join_count: value.join_count.max(0) as u32,
            last_message_at: value.last_message_at,
        })
    }
}

const MEMBER_COLUMNS: &str = "room_id, user_id, username, joined_at, left_at, is_active, \
     messages_in_room, join_count, last_message_at";

#[derive(Clone)]
pub struct PgMemberRepository {
    pool: PgPool,
}

impl PgMemberRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemberRepository for PgMemberRepository {
    async fn join(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
        at: Timestamp,
    ) -> Result<RoomMember, RepositoryError> {
        let record = sqlx::query_as::<_, MemberRecord>(
            "INSERT INTO room_members (room_id, user_id, username, joined_at, is_active, join_count) \
             VALUES ($1, $2, $3, $4, TRUE, 1) \
             ON CONFLICT (room_id, user_id) DO UPDATE SET \
                 is_active = TRUE, \
                 left_at = NULL, \
                 joined_at = CASE WHEN room_members.is_active \
                     THEN room_members.joined_at ELSE EXCLUDED.joined_at END, \
                 join_count = room_members.join_count + \
                     CASE WHEN room_members.is_active THEN 0 ELSE 1 END \
             RETURNING room_id, user_id, username, joined_at, left_at, is_active, \
                       messages_in_room, join_count, last_message_at",
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .bind(username.as_str())
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        RoomMember::try_from(record)
    }

    async fn leave(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE room_members SET is_active = FALSE, left_at = $3 \
             WHERE room_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn active_members(&self, room_id: RoomId) -> Result<Vec<RoomMember>, RepositoryError> {
        let records = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM room_members WHERE room_id = $1 AND is_active"
        ))
        .bind(Uuid::from(room_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        records.into_iter().map(RoomMember::try_from).collect()
    }

    async fn active_rooms_of(&self, user_id: UserId) -> Result<Vec<RoomId>, RepositoryError> {
        let rows = sqlx::query("SELECT room_id FROM room_members WHERE user_id = $1 AND is_active")
            .bind(Uuid::from(user_id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<Uuid, _>("room_id")
                    .map(RoomId::from)
                    .map_err(map_sqlx_err)
            })
            .collect()
    }

    async fn record_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE room_members SET messages_in_room = messages_in_room + 1, last_message_at = $3 \
             WHERE room_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn purge_inactive(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM room_members WHERE NOT is_active AND left_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    room_id: Uuid,
    user_id: Uuid,
    username: String,
    content: String,
    created_at: OffsetDateTime,
    kind: String,
    edited: bool,
    edited_at: Option<OffsetDateTime>,
}

impl From<MessageRecord> for Message {
    fn from(value: MessageRecord) -> Self {
        Message {
            id: MessageId::from(value.id),
            room_id: RoomId::from(value.room_id),
            user_id: UserId::from(value.user_id),
            username: value.username,
            content: value.content,
            timestamp: value.created_at,
            kind: kind_from_str(&value.kind),
            edited: value.edited,
            edited_at: value.edited_at,
        }
    }
}

const MESSAGE_COLUMNS: &str =
    "id, room_id, user_id, username, content, created_at, kind, edited, edited_at";

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(
            "INSERT INTO messages (id, room_id, user_id, username, content, created_at, kind, \
                                   edited, edited_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET content = messages.content \
             RETURNING id, room_id, user_id, username, content, created_at, kind, edited, edited_at",
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.room_id))
        .bind(Uuid::from(message.user_id))
        .bind(&message.username)
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(kind_to_str(message.kind))
        .bind(message.edited)
        .bind(message.edited_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(Message::from(record))
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(record.map(Message::from))
    }

    async fn history(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE room_id = $1 \
               AND ($2::uuid IS NULL \
                    OR created_at < (SELECT created_at FROM messages WHERE id = $2)) \
             ORDER BY created_at DESC LIMIT $3"
        ))
        .bind(Uuid::from(room_id))
        .bind(before.map(Uuid::from))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(records.into_iter().map(Message::from).collect())
    }

    async fn by_user(&self, user_id: UserId, limit: u32) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(Uuid::from(user_id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(records.into_iter().map(Message::from).collect())
    }

    async fn update_content(
        &self,
        id: MessageId,
        content: &str,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "UPDATE messages SET content = $2, edited = TRUE, edited_at = $3 \
             WHERE id = $1 \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::from(id))
        .bind(content)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RepositoryError::NotFound)?;
        Ok(Message::from(record))
    }

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn purge_expired(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM messages WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn room_stats(
        &self,
        room_id: RoomId,
        hours_back: u32,
    ) -> Result<RoomMessageStats, RepositoryError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS messages, COUNT(DISTINCT user_id) AS senders, \
                    MIN(created_at) AS first_at, MAX(created_at) AS last_at \
             FROM messages \
             WHERE room_id = $1 AND created_at >= NOW() - make_interval(hours => $2)",
        )
        .bind(Uuid::from(room_id))
        .bind(hours_back as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(RoomMessageStats {
            messages: row.try_get::<i64, _>("messages").map_err(map_sqlx_err)?.max(0) as u64,
            senders: row.try_get::<i64, _>("senders").map_err(map_sqlx_err)?.max(0) as u64,
            first_at: row.try_get("first_at").map_err(map_sqlx_err)?,
            last_at: row.try_get("last_at").map_err(map_sqlx_err)?,
        })
    }
}
