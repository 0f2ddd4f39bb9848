//! 用户注册表
//!
//! 维护认证状态和连接↔用户双向映射。同一用户名在线时再次认证
//! 视为重连/多设备，挂接到既有用户；离线用户名分配全新用户。
//! 这条路径不会产生 USER_EXISTS。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domain::{ConnectionId, RoomName, User, UserId, Username};
use tokio::sync::RwLock;

use crate::cache::{keys, LayeredCache, DEFAULT_TTL};
use crate::clock::Clock;
use crate::error::ApplicationResult;
use crate::repository::UserRepository;
use crate::services::room_registry::RoomRegistry;

pub struct UserRegistryDependencies {
    pub users: Arc<dyn UserRepository>,
    pub rooms: Arc<RoomRegistry>,
    pub cache: Arc<LayeredCache>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub user: User,
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub struct DisconnectOutcome {
    pub user_id: UserId,
    pub username: Username,
    pub went_offline: bool,
    pub rooms_left: Vec<RoomName>,
}

pub struct UserRegistry {
    deps: UserRegistryDependencies,
    connection_users: RwLock<HashMap<ConnectionId, UserId>>,
    user_connections: RwLock<HashMap<UserId, HashSet<ConnectionId>>>,
}

impl UserRegistry {
    pub fn new(deps: UserRegistryDependencies) -> Self {
        Self {
            deps,
            connection_users: RwLock::new(HashMap::new()),
            user_connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn authenticate(
        &self,
        raw_username: &str,
        connection_id: ConnectionId,
    ) -> ApplicationResult<AuthOutcome> {
        let username = Username::parse(raw_username)?;

        let outcome = match self.deps.users.find_by_username_online(&username).await? {
            Some(mut user) => {
                // 重连或多设备：挂接到既有用户
                let connections = self
                    .deps
                    .users
                    .adjust_connections(user.id, 1)
                    .await?;
                user.connection_count = connections;
                tracing::info!(user_id = %user.id, username = %username, connections, "用户重连");
                AuthOutcome {
                    user,
                    is_new: false,
                }
            }
            None => {
                let user = User::new(UserId::random(), username.clone(), self.deps.clock.now());
                let user = self.deps.users.create(user).await?;
                tracing::info!(user_id = %user.id, username = %username, "新用户上线");
                AuthOutcome { user, is_new: true }
            }
        };

        self.connection_users
            .write()
            .await
            .insert(connection_id, outcome.user.id);
        self.user_connections
            .write()
            .await
            .entry(outcome.user.id)
            .or_default()
            .insert(connection_id);

        self.cache_user(&outcome.user).await;
        Ok(outcome)
    }

    /// 连接关闭时调用；最后一个连接消失时用户下线并离开所有房间。
    pub async fn disconnect(
        &self,
        connection_id: ConnectionId,
    ) -> ApplicationResult<Option<DisconnectOutcome>> {
        let user_id = match self.connection_users.write().await.remove(&connection_id) {
            Some(id) => id,
            None => return Ok(None),
        };

        let remaining = {
            let mut map = self.user_connections.write().await;
            if let Some(connections) = map.get_mut(&user_id) {
                connections.remove(&connection_id);
                let remaining = connections.len();
                if remaining == 0 {
                    map.remove(&user_id);
                }
                remaining
            } else {
                0
            }
        };

        if let Err(err) = self.deps.users.adjust_connections(user_id, -1).await {
            tracing::warn!(user_id = %user_id, error = %err, "connection counter update failed");
        }

        let user = match self.deps.users.find_by_id(user_id).await? {
            Some(user) => user,
            None => return Ok(None),
        };

        if remaining > 0 {
            return Ok(Some(DisconnectOutcome {
                user_id,
                username: user.username.clone(),
                went_offline: false,
                rooms_left: Vec::new(),
            }));
        }

        let rooms_left = self.deps.rooms.leave_all(&user).await;
        self.deps
            .users
            .set_online(user_id, false, self.deps.clock.now())
            .await?;
        self.deps
            .cache
            .invalidate(&keys::user_info(user_id), false)
            .await;
        self.deps.cache.invalidate(keys::ONLINE_USERS, false).await;

        tracing::info!(user_id = %user_id, username = %user.username, rooms = rooms_left.len(), "用户下线");
        Ok(Some(DisconnectOutcome {
            user_id,
            username: user.username,
            went_offline: true,
            rooms_left,
        }))
    }

    /// 当前在线用户快照。
    pub async fn online_users(&self) -> ApplicationResult<Vec<User>> {
        Ok(self.deps.users.online_users().await?)
    }

    /// 用户信息，读穿缓存。
    pub async fn user_info(&self, user_id: UserId) -> ApplicationResult<Option<User>> {
        let key = keys::user_info(user_id);
        if let Some(value) = self.deps.cache.get(&key).await {
            if let Ok(user) = serde_json::from_value::<User>(value) {
                return Ok(Some(user));
            }
        }
        match self.deps.users.find_by_id(user_id).await? {
            Some(user) => {
                self.cache_user(&user).await;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    async fn cache_user(&self, user: &User) {
        if let Ok(value) = serde_json::to_value(user) {
            self.deps
                .cache
                .set(&keys::user_info(user.id), value, DEFAULT_TTL, &[])
                .await;
        }
    }
}
