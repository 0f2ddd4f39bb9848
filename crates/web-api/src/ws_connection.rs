//! 单个 WebSocket 连接的生命周期
//!
//! 接入 → 注册 → 欢迎帧 → 拆分读写：写任务消费出站通道（保证
//! 帧序），读循环按到达顺序解析并分发（单连接 FIFO）。单帧错误
//! 只回 `error` 帧；超限帧和传输错误才关闭 socket。

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use domain::{ConnectionId, ErrorCode};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatch;
use crate::hub::Outbound;
use crate::protocol::{ClientFrame, ErrorBody, ServerFrame, MAX_FRAME_BYTES};
use crate::state::AppState;

const WELCOME: &str = "Welcome! Authenticate with {\"type\":\"auth\",\"username\":\"...\"}";

pub async fn serve_socket(socket: WebSocket, remote: SocketAddr, state: AppState) {
    let ip = remote.ip().to_string();
    let connection_id = ConnectionId::random();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);

    state
        .hub
        .register(connection_id, ip.clone(), out_tx.clone())
        .await;
    state
        .metrics
        .connections_accepted
        .fetch_add(1, Ordering::Relaxed);
    state
        .metrics
        .connections_current
        .fetch_add(1, Ordering::Relaxed);
    info!(connection_id = %connection_id, remote = %remote, "连接已建立");

    let (mut sink, mut stream) = socket.split();

    // 写任务：所有出站流量经由这里，串行且保序
    let writer_state = state.clone();
    let write_task = tokio::spawn(async move {
        while let Some(command) = out_rx.recv().await {
            match command {
                Outbound::Frame(frame) => {
                    let text = frame.to_wire(writer_state.clock.now());
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                    writer_state
                        .metrics
                        .frames_out
                        .fetch_add(1, Ordering::Relaxed);
                }
                Outbound::Ping => {
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Pong(data) => {
                    if sink.send(WsMessage::Pong(data.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    state
        .hub
        .send_to(
            connection_id,
            ServerFrame::System {
                message: WELCOME.to_owned(),
            },
        )
        .await;

    // 读循环：帧按发送顺序处理
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                // 传输层错误（含非法 UTF-8）：协议不可用
                debug!(connection_id = %connection_id, error = %err, "socket error");
                break;
            }
        };

        match message {
            WsMessage::Text(text) => {
                state.hub.touch(connection_id).await;
                if text.len() > MAX_FRAME_BYTES {
                    let _ = out_tx
                        .send(Outbound::Close {
                            code: 1009,
                            reason: "frame too large",
                        })
                        .await;
                    break;
                }
                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(connection_id = %connection_id, error = %err, "unparseable frame");
                        state.metrics.errors.fetch_add(1, Ordering::Relaxed);
                        state
                            .hub
                            .send_to(
                                connection_id,
                                ServerFrame::error(ErrorBody::new(
                                    ErrorCode::InvalidMessage,
                                    "malformed or unknown frame",
                                )),
                            )
                            .await;
                        continue;
                    }
                };
                state.metrics.record_frame(frame.kind());
                dispatch::dispatch(&state, connection_id, &ip, frame).await;
            }
            WsMessage::Binary(_) => {
                state.metrics.errors.fetch_add(1, Ordering::Relaxed);
                state
                    .hub
                    .send_to(
                        connection_id,
                        ServerFrame::error(ErrorBody::new(
                            ErrorCode::InvalidMessage,
                            "binary frames are not supported",
                        )),
                    )
                    .await;
            }
            WsMessage::Ping(data) => {
                let _ = out_tx.send(Outbound::Pong(data.to_vec())).await;
            }
            WsMessage::Pong(_) => {
                state.hub.mark_alive(connection_id).await;
            }
            WsMessage::Close(_) => break,
        }
    }

    cleanup(&state, connection_id).await;
    write_task.abort();
    state
        .metrics
        .connections_current
        .fetch_sub(1, Ordering::Relaxed);
    info!(connection_id = %connection_id, "连接已关闭");
}

async fn cleanup(state: &AppState, connection_id: ConnectionId) {
    let snapshot = state.hub.deregister(connection_id).await;
    let Some(snapshot) = snapshot else { return };

    if let Some(room_id) = snapshot.room_id {
        state.hub.unwatch_room(room_id).await;
    }

    if snapshot.authenticated {
        match state.users.disconnect(connection_id).await {
            Ok(Some(summary)) => {
                info!(
                    connection_id = %connection_id,
                    username = %summary.username,
                    went_offline = summary.went_offline,
                    rooms_left = summary.rooms_left.len(),
                    "连接清理完成"
                );
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(connection_id = %connection_id, error = %err, "disconnect cleanup failed");
            }
        }
    }
}
