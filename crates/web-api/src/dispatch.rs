//! 帧路由
//!
//! 类型化信封的分发点：先限流（按远端地址、按帧类别），再做
//! 认证前置检查，然后分派到各处理器。任何异常都被收敛成带
//! correlation id 的 `error` 帧，单帧错误从不断开 socket。

use application::error::{ApplicationError, ApplicationResult};
use application::rate_limiter::ActionClass;
use application::services::HISTORY_LIMIT;
use std::sync::atomic::Ordering;

use domain::{ConnectionId, DomainError, ErrorCode, MessageId, MessageKind, RoomId, User};

use crate::hub::ConnectionSnapshot;
use crate::protocol::{
    ClientFrame, ErrorBody, JoinedRoomRef, RoomRef, RoomSummary, ServerFrame, UserRef, WireMessage,
};
use crate::state::AppState;

/// `rooms` 命令的上限。
const ROOM_LIST_MAX: u32 = 100;

pub async fn dispatch(state: &AppState, connection_id: ConnectionId, ip: &str, frame: ClientFrame) {
    // 限流类别映射；没有映射的帧类型直接放行
    let class = match &frame {
        ClientFrame::SendMessage { .. } => Some(ActionClass::Message),
        ClientFrame::CreateRoom { .. } => Some(ActionClass::RoomCreate),
        ClientFrame::Command { .. } => Some(ActionClass::Command),
        _ => None,
    };
    if let Some(class) = class {
        let decision = state.rate_limiter.check(ip, class).await;
        if !decision.allowed {
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            state
                .hub
                .send_to(
                    connection_id,
                    ServerFrame::error(
                        ErrorBody::new(ErrorCode::RateLimit, "rate limit exceeded")
                            .with_retry_after(decision.retry_after_secs),
                    ),
                )
                .await;
            return;
        }
    }

    let snapshot = match state.hub.snapshot(connection_id).await {
        Some(snapshot) => snapshot,
        None => return,
    };

    // 认证前置：auth 之外的一切帧都要求已认证
    if !snapshot.authenticated && !matches!(frame, ClientFrame::Auth { .. }) {
        state.metrics.errors.fetch_add(1, Ordering::Relaxed);
        state
            .hub
            .send_to(
                connection_id,
                ServerFrame::error(ErrorBody::new(
                    ErrorCode::Unauthorized,
                    "authenticate before sending frames",
                )),
            )
            .await;
        return;
    }

    let result = match frame {
        ClientFrame::Auth { username } => {
            handle_auth(state, connection_id, &snapshot, &username).await
        }
        ClientFrame::CreateRoom { room_name } => {
            handle_create_room(state, connection_id, &snapshot, &room_name).await
        }
        ClientFrame::JoinRoom { room_name } => {
            handle_join_room(state, connection_id, &snapshot, &room_name).await
        }
        ClientFrame::LeaveRoom => handle_leave_room(state, connection_id, &snapshot).await,
        ClientFrame::SendMessage { content } => {
            handle_send_message(state, connection_id, &snapshot, &content).await
        }
        ClientFrame::TypingStart => handle_typing(state, &snapshot, true).await,
        ClientFrame::TypingStop => handle_typing(state, &snapshot, false).await,
        ClientFrame::Command { command, args } => {
            handle_command(state, connection_id, &snapshot, &command, &args).await
        }
    };

    if let Err(err) = result {
        state.metrics.errors.fetch_add(1, Ordering::Relaxed);
        let body = ErrorBody::new(err.code(), err.to_string());
        tracing::debug!(
            connection_id = %connection_id,
            code = body.code.as_str(),
            correlation_id = %body.correlation_id,
            error = %err,
            "frame handling failed"
        );
        state
            .hub
            .send_to(connection_id, ServerFrame::error(body))
            .await;
    }
}

async fn current_user(state: &AppState, snapshot: &ConnectionSnapshot) -> ApplicationResult<User> {
    let user_id = snapshot.user_id.ok_or(ApplicationError::Unauthorized)?;
    state
        .users
        .user_info(user_id)
        .await?
        .ok_or(ApplicationError::Unauthorized)
}

async fn handle_auth(
    state: &AppState,
    connection_id: ConnectionId,
    snapshot: &ConnectionSnapshot,
    username: &str,
) -> ApplicationResult<()> {
    if snapshot.authenticated {
        state
            .hub
            .send_to(
                connection_id,
                ServerFrame::error(ErrorBody::new(
                    ErrorCode::InvalidMessage,
                    "already authenticated",
                )),
            )
            .await;
        return Ok(());
    }

    match state.users.authenticate(username, connection_id).await {
        Ok(outcome) => {
            state.hub.mark_authenticated(connection_id, &outcome.user).await;
            state.metrics.authentications.fetch_add(1, Ordering::Relaxed);
            state
                .hub
                .send_to(
                    connection_id,
                    ServerFrame::AuthSuccess {
                        user: UserRef::from(&outcome.user),
                    },
                )
                .await;
        }
        Err(err) => {
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            state
                .hub
                .send_to(
                    connection_id,
                    ServerFrame::AuthError {
                        error: ErrorBody::new(err.code(), err.to_string()),
                    },
                )
                .await;
        }
    }
    Ok(())
}

async fn handle_create_room(
    state: &AppState,
    connection_id: ConnectionId,
    snapshot: &ConnectionSnapshot,
    room_name: &str,
) -> ApplicationResult<()> {
    let user = current_user(state, snapshot).await?;
    let room = state.rooms.create(room_name, &user).await?;
    state.metrics.rooms_created.fetch_add(1, Ordering::Relaxed);

    // 持久化的创建通知，晚到的成员在历史里也能看到
    if let Err(err) = state
        .messages
        .system_broadcast(
            room.id,
            &format!("房间 {} 由 {} 创建", room.name, user.username),
            MessageKind::Notification,
        )
        .await
    {
        tracing::debug!(room_id = %room.id, error = %err, "creation notification failed");
    }

    state
        .hub
        .send_to(
            connection_id,
            ServerFrame::RoomCreated {
                room: RoomRef {
                    id: room.id.to_string(),
                    name: room.name.as_str().to_owned(),
                },
            },
        )
        .await;

    // 创建者随即加入自己的房间
    join_flow(state, connection_id, snapshot, &user, room.name.as_str()).await
}

async fn handle_join_room(
    state: &AppState,
    connection_id: ConnectionId,
    snapshot: &ConnectionSnapshot,
    room_name: &str,
) -> ApplicationResult<()> {
    let user = current_user(state, snapshot).await?;
    join_flow(state, connection_id, snapshot, &user, room_name).await
}

async fn join_flow(
    state: &AppState,
    connection_id: ConnectionId,
    snapshot: &ConnectionSnapshot,
    user: &User,
    room_name: &str,
) -> ApplicationResult<()> {
    // 已在别的房间：先离开再加入
    if let (Some(current_id), Some(current_name)) = (snapshot.room_id, snapshot.room_name.clone())
    {
        leave_flow(state, connection_id, user, current_id, &current_name).await?;
    }

    let outcome = state.rooms.join(room_name, user).await?;
    state.hub.watch_room(outcome.room.id).await;
    state
        .hub
        .set_room(
            connection_id,
            Some((outcome.room.id, outcome.room.name.as_str().to_owned())),
        )
        .await;

    state
        .hub
        .send_to(
            connection_id,
            ServerFrame::RoomJoined {
                room: JoinedRoomRef {
                    id: outcome.room.id.to_string(),
                    name: outcome.room.name.as_str().to_owned(),
                    member_count: outcome.member_count,
                },
                members: outcome.members,
            },
        )
        .await;

    let history = state.messages.history(outcome.room.id, HISTORY_LIMIT).await;
    state
        .hub
        .send_to(
            connection_id,
            ServerFrame::MessageHistory {
                messages: history.iter().map(WireMessage::from).collect(),
            },
        )
        .await;

    Ok(())
}

async fn handle_leave_room(
    state: &AppState,
    connection_id: ConnectionId,
    snapshot: &ConnectionSnapshot,
) -> ApplicationResult<()> {
    let user = current_user(state, snapshot).await?;
    match (snapshot.room_id, snapshot.room_name.clone()) {
        (Some(room_id), Some(room_name)) => {
            leave_flow(state, connection_id, &user, room_id, &room_name).await
        }
        _ => Err(DomainError::room_not_found("not in a room").into()),
    }
}

async fn leave_flow(
    state: &AppState,
    connection_id: ConnectionId,
    user: &User,
    room_id: RoomId,
    room_name: &str,
) -> ApplicationResult<()> {
    state.rooms.leave(room_id, user).await?;
    state.hub.set_room(connection_id, None).await;
    state.hub.unwatch_room(room_id).await;
    state
        .hub
        .send_to(
            connection_id,
            ServerFrame::RoomLeft {
                room_name: room_name.to_owned(),
            },
        )
        .await;
    Ok(())
}

async fn handle_send_message(
    state: &AppState,
    _connection_id: ConnectionId,
    snapshot: &ConnectionSnapshot,
    content: &str,
) -> ApplicationResult<()> {
    let room_id = snapshot
        .room_id
        .ok_or_else(|| DomainError::validation("room", "join a room before sending"))?;
    let user = current_user(state, snapshot).await?;

    state.messages.send(room_id, &user, content).await?;
    state.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
    // 发送者不回显：客户端本地已经渲染了自己的消息
    Ok(())
}

async fn handle_typing(
    state: &AppState,
    snapshot: &ConnectionSnapshot,
    is_typing: bool,
) -> ApplicationResult<()> {
    // 不在房间里的输入指示静默丢弃
    let Some(room_id) = snapshot.room_id else {
        return Ok(());
    };
    let user = current_user(state, snapshot).await?;
    state.rooms.typing(room_id, &user, is_typing).await;
    Ok(())
}

async fn handle_command(
    state: &AppState,
    connection_id: ConnectionId,
    snapshot: &ConnectionSnapshot,
    command: &str,
    args: &[String],
) -> ApplicationResult<()> {
    match command {
        "rooms" => {
            let limit = args
                .first()
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(20)
                .clamp(1, ROOM_LIST_MAX);
            let rooms = state.rooms.list_active(limit).await?;
            let summaries: Vec<RoomSummary> = rooms
                .iter()
                .map(|room| RoomSummary {
                    name: room.name.as_str().to_owned(),
                    users: room.current_users,
                    messages: room.message_count,
                    created_at: room.created_at,
                })
                .collect();
            let count = summaries.len();
            state
                .hub
                .send_to(connection_id, ServerFrame::RoomList {
                    rooms: summaries,
                    count,
                })
                .await;
        }
        "users" => {
            let (room, users) = match snapshot.room_id {
                Some(room_id) => (
                    snapshot.room_name.clone(),
                    state.rooms.member_list(room_id).await,
                ),
                None => {
                    let online = state.users.online_users().await?;
                    (
                        None,
                        online
                            .iter()
                            .map(|u| u.username.as_str().to_owned())
                            .collect(),
                    )
                }
            };
            let count = users.len();
            state
                .hub
                .send_to(connection_id, ServerFrame::UserList { room, users, count })
                .await;
        }
        "help" => {
            let message = "可用命令: /rooms [limit] 活跃房间 | /users 在线或房间成员 | \
                           /stats 统计 | /me 个人信息 | /edit <id> <内容> | /delete <id> | \
                           /clear 清屏 | /help 本帮助"
                .to_owned();
            state
                .hub
                .send_to(connection_id, ServerFrame::System { message })
                .await;
        }
        "stats" => {
            let message = match snapshot.room_id {
                Some(room_id) => {
                    let stats = state.messages.room_stats(room_id, 24).await?;
                    let room = snapshot.room_name.clone().unwrap_or_default();
                    format!(
                        "房间 {room}: 最近 24 小时 {} 条消息，{} 位发送者",
                        stats.messages, stats.senders
                    )
                }
                None => {
                    let online = state.users.online_users().await?.len();
                    let rooms = state.rooms.list_active(20).await?.len();
                    let connections = state.hub.connection_count().await;
                    format!("在线用户 {online}，活跃房间 {rooms}，本实例连接 {connections}")
                }
            };
            state
                .hub
                .send_to(connection_id, ServerFrame::System { message })
                .await;
        }
        "me" => {
            let user = current_user(state, snapshot).await?;
            let last_message = state
                .messages
                .last_message_of(user.id)
                .await
                .map(|m| m.content)
                .unwrap_or_else(|| "（还没有发言）".to_owned());
            let message = format!(
                "{} ({}): 消息 {} 条，到过 {} 个房间，当前 {}，最近一条: {}",
                user.username,
                user.id,
                user.total_messages,
                user.rooms_joined.len(),
                user.current_room
                    .as_ref()
                    .map(|r| r.as_str().to_owned())
                    .unwrap_or_else(|| "不在房间".to_owned()),
                last_message
            );
            state
                .hub
                .send_to(connection_id, ServerFrame::System { message })
                .await;
        }
        "clear" => {
            state
                .hub
                .send_to(connection_id, ServerFrame::ClearScreen)
                .await;
        }
        // 5 分钟窗口内的作者本人操作
        "edit" => {
            let user = current_user(state, snapshot).await?;
            let (id, rest) = parse_message_command(args)?;
            let edited = state.messages.edit(id, &user, &rest).await?;
            state
                .hub
                .send_to(connection_id, ServerFrame::System {
                    message: format!("消息 {} 已编辑", edited.id),
                })
                .await;
        }
        "delete" => {
            let user = current_user(state, snapshot).await?;
            let id = args
                .first()
                .and_then(|raw| raw.parse::<uuid::Uuid>().ok())
                .map(MessageId::from)
                .ok_or_else(|| DomainError::validation("command", "usage: delete <messageId>"))?;
            state.messages.delete(id, &user).await?;
            state
                .hub
                .send_to(connection_id, ServerFrame::System {
                    message: format!("消息 {id} 已删除"),
                })
                .await;
        }
        other => {
            return Err(
                DomainError::validation("command", format!("unknown command: {other}")).into(),
            );
        }
    }

    Ok(())
}

fn parse_message_command(args: &[String]) -> Result<(MessageId, String), DomainError> {
    let id = args
        .first()
        .and_then(|raw| raw.parse::<uuid::Uuid>().ok())
        .map(MessageId::from)
        .ok_or_else(|| DomainError::validation("command", "usage: edit <messageId> <content>"))?;
    let rest = args[1..].join(" ");
    if rest.trim().is_empty() {
        return Err(DomainError::validation(
            "command",
            "usage: edit <messageId> <content>",
        ));
    }
    Ok((id, rest))
}
