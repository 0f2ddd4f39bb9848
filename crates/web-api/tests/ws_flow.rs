mod support;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};

use support::{spawn_server, TestServer};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_millis(300);

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn connect(server: &TestServer) -> Self {
        let (ws, _) = connect_async(server.ws_url()).await.expect("ws connect");
        Self { ws }
    }

    async fn send(&mut self, frame: Value) {
        self.ws
            .send(TungsteniteMessage::Text(frame.to_string().into()))
            .await
            .expect("send frame");
    }

    /// 下一个文本帧。
    async fn recv(&mut self) -> Value {
        loop {
            let message = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("frame in time")
                .expect("socket open")
                .expect("frame");
            match message {
                TungsteniteMessage::Text(payload) => {
                    return serde_json::from_str(&payload).expect("json frame");
                }
                TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    /// 跳帧直到指定 type。
    async fn recv_type(&mut self, kind: &str) -> Value {
        for _ in 0..20 {
            let frame = self.recv().await;
            if frame["type"] == kind {
                return frame;
            }
        }
        panic!("frame of type {kind} never arrived");
    }

    /// 断言窗口期内没有指定 type 的帧到达。
    async fn assert_silent(&mut self, kind: &str) {
        let outcome = timeout(SILENCE_WINDOW, self.ws.next()).await;
        if let Ok(Some(Ok(TungsteniteMessage::Text(payload)))) = outcome {
            let frame: Value = serde_json::from_str(&payload).expect("json frame");
            assert_ne!(frame["type"], kind, "unexpected {kind} frame: {frame}");
        }
    }

    async fn auth(&mut self, username: &str) -> Value {
        self.send(json!({"type": "auth", "username": username}))
            .await;
        self.recv_type("auth_success").await
    }
}

#[tokio::test]
async fn happy_path_two_users_chat() {
    let server = spawn_server().await;

    let mut alice = Client::connect(&server).await;
    let welcome = alice.recv().await;
    assert_eq!(welcome["type"], "system");

    let auth = alice.auth("alice").await;
    assert!(auth["user"]["userId"].is_string());
    assert_eq!(auth["user"]["username"], "alice");

    alice
        .send(json!({"type": "create_room", "roomName": "lobby"}))
        .await;
    let created = alice.recv_type("room_created").await;
    assert_eq!(created["room"]["name"], "lobby");
    let joined = alice.recv_type("room_joined").await;
    assert_eq!(joined["room"]["memberCount"], 1);
    // 新房间的历史只有持久化的创建通知
    let history = alice.recv_type("message_history").await;
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "notification");
    assert_eq!(messages[0]["userId"], "system");

    let mut bob = Client::connect(&server).await;
    bob.auth("bob").await;
    bob.send(json!({"type": "join_room", "roomName": "lobby"}))
        .await;
    let joined = bob.recv_type("room_joined").await;
    assert_eq!(joined["room"]["memberCount"], 2);
    assert!(joined["members"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m == "alice"));
    bob.recv_type("message_history").await;

    // join 在 bob 的首条消息前被其他成员观察到
    let user_joined = alice.recv_type("user_joined").await;
    assert_eq!(user_joined["user"]["username"], "bob");
    assert_eq!(user_joined["memberCount"], 2);

    bob.send(json!({"type": "send_message", "content": "hi"}))
        .await;
    let message = alice.recv_type("message").await;
    assert_eq!(message["message"]["username"], "bob");
    assert_eq!(message["message"]["content"], "hi");
    assert!(message["timestamp"].is_string());

    // 发送者不收到自己的消息回显
    bob.assert_silent("message").await;
}

#[tokio::test]
async fn creating_a_taken_room_name_is_rejected() {
    let server = spawn_server().await;

    let mut alice = Client::connect(&server).await;
    alice.auth("alice").await;
    alice
        .send(json!({"type": "create_room", "roomName": "lobby"}))
        .await;
    alice.recv_type("room_joined").await;

    let mut carol = Client::connect(&server).await;
    carol.auth("carol").await;
    carol
        .send(json!({"type": "create_room", "roomName": "lobby"}))
        .await;
    let error = carol.recv_type("error").await;
    assert_eq!(error["error"]["code"], "ROOM_EXISTS");
    assert!(error["error"]["correlationId"].is_string());

    // 房间状态不受影响：carol 仍然可以加入
    carol
        .send(json!({"type": "join_room", "roomName": "lobby"}))
        .await;
    let joined = carol.recv_type("room_joined").await;
    assert_eq!(joined["room"]["memberCount"], 2);
}

#[tokio::test]
async fn frames_before_auth_are_rejected_and_socket_stays_open() {
    let server = spawn_server().await;

    let mut dave = Client::connect(&server).await;
    dave.recv_type("system").await;

    dave.send(json!({"type": "send_message", "content": "sneaky"}))
        .await;
    let error = dave.recv_type("error").await;
    assert_eq!(error["error"]["code"], "UNAUTHORIZED");

    // socket 未被关闭：认证依旧可行
    let auth = dave.auth("dave").await;
    assert_eq!(auth["user"]["username"], "dave");
}

#[tokio::test]
async fn malformed_and_unknown_frames_yield_invalid_message() {
    let server = spawn_server().await;

    let mut eve = Client::connect(&server).await;
    eve.auth("eve").await;

    eve.ws
        .send(TungsteniteMessage::Text("this is not json".into()))
        .await
        .unwrap();
    let error = eve.recv_type("error").await;
    assert_eq!(error["error"]["code"], "INVALID_MESSAGE");

    eve.send(json!({"type": "teleport", "to": "narnia"})).await;
    let error = eve.recv_type("error").await;
    assert_eq!(error["error"]["code"], "INVALID_MESSAGE");
}

#[tokio::test]
async fn eleventh_message_within_a_second_hits_the_rate_limit() {
    let server = spawn_server().await;

    let mut erin = Client::connect(&server).await;
    erin.auth("erin").await;
    erin.send(json!({"type": "create_room", "roomName": "busy"}))
        .await;
    erin.recv_type("room_joined").await;

    let mut frank = Client::connect(&server).await;
    frank.auth("frank").await;
    frank
        .send(json!({"type": "join_room", "roomName": "busy"}))
        .await;
    frank.recv_type("room_joined").await;

    for i in 0..11 {
        erin.send(json!({
            "type": "send_message",
            "content": format!("flood wave number {i} incoming")
        }))
        .await;
    }

    // 前 10 条正常扇出
    for _ in 0..10 {
        frank.recv_type("message").await;
    }
    frank.assert_silent("message").await;

    // 第 11 条触发限流
    let error = erin.recv_type("error").await;
    assert_eq!(error["error"]["code"], "RATE_LIMIT");
    assert!(error["error"]["retryAfter"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn typing_indicator_expires_within_three_seconds() {
    let server = spawn_server().await;

    let mut frank = Client::connect(&server).await;
    frank.auth("frank").await;
    frank
        .send(json!({"type": "create_room", "roomName": "quiet"}))
        .await;
    frank.recv_type("room_joined").await;

    let mut grace = Client::connect(&server).await;
    grace.auth("grace").await;
    grace
        .send(json!({"type": "join_room", "roomName": "quiet"}))
        .await;
    grace.recv_type("room_joined").await;

    frank.send(json!({"type": "typing_start"})).await;

    let update = grace.recv_type("typing_update").await;
    assert_eq!(update["typingUsers"], json!(["frank"]));

    // 没有后续帧：TTL 内回落为空集合
    let update = grace.recv_type("typing_update").await;
    assert_eq!(update["typingUsers"], json!([]));
}

#[tokio::test]
async fn emptied_room_rejects_subsequent_joins() {
    let server = spawn_server().await;

    let mut alice = Client::connect(&server).await;
    alice.auth("alice").await;
    alice
        .send(json!({"type": "create_room", "roomName": "fleeting"}))
        .await;
    alice.recv_type("room_joined").await;

    let mut bob = Client::connect(&server).await;
    bob.auth("bob").await;
    bob.send(json!({"type": "join_room", "roomName": "fleeting"}))
        .await;
    bob.recv_type("room_joined").await;

    alice.send(json!({"type": "leave_room"})).await;
    alice.recv_type("room_left").await;
    bob.send(json!({"type": "leave_room"})).await;
    bob.recv_type("room_left").await;

    let mut grace = Client::connect(&server).await;
    grace.auth("grace").await;
    grace
        .send(json!({"type": "join_room", "roomName": "fleeting"}))
        .await;
    let error = grace.recv_type("error").await;
    assert_eq!(error["error"]["code"], "ROOM_NOT_FOUND");
}

#[tokio::test]
async fn disconnect_broadcasts_user_left_and_frees_the_room() {
    let server = spawn_server().await;

    let mut alice = Client::connect(&server).await;
    alice.auth("alice").await;
    alice
        .send(json!({"type": "create_room", "roomName": "lobby"}))
        .await;
    alice.recv_type("room_joined").await;

    let mut bob = Client::connect(&server).await;
    bob.auth("bob").await;
    bob.send(json!({"type": "join_room", "roomName": "lobby"}))
        .await;
    bob.recv_type("room_joined").await;
    alice.recv_type("user_joined").await;

    drop(bob);

    let left = alice.recv_type("user_left").await;
    assert_eq!(left["user"]["username"], "bob");
    assert_eq!(left["memberCount"], 1);
}

#[tokio::test]
async fn commands_answer_with_lists_and_clear_screen() {
    let server = spawn_server().await;

    let mut alice = Client::connect(&server).await;
    alice.auth("alice").await;
    alice
        .send(json!({"type": "create_room", "roomName": "lobby"}))
        .await;
    alice.recv_type("room_joined").await;

    alice
        .send(json!({"type": "command", "command": "rooms"}))
        .await;
    let rooms = alice.recv_type("room_list").await;
    assert_eq!(rooms["count"], 1);
    assert_eq!(rooms["rooms"][0]["name"], "lobby");
    assert_eq!(rooms["rooms"][0]["users"], 1);

    alice
        .send(json!({"type": "command", "command": "users"}))
        .await;
    let users = alice.recv_type("user_list").await;
    assert_eq!(users["room"], "lobby");
    assert_eq!(users["users"], json!(["alice"]));

    alice
        .send(json!({"type": "command", "command": "clear"}))
        .await;
    let clear = alice.recv_type("CLEAR_SCREEN").await;
    assert_eq!(clear["type"], "CLEAR_SCREEN");

    alice
        .send(json!({"type": "command", "command": "warp"}))
        .await;
    let error = alice.recv_type("error").await;
    assert_eq!(error["error"]["code"], "INVALID_MESSAGE");
}

#[tokio::test]
async fn health_and_metrics_endpoints_respond() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(server.http_url("/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["degraded"], false);

    // 产生一点流量
    let mut alice = Client::connect(&server).await;
    alice.auth("alice").await;

    let metrics: Value = client
        .get(server.http_url("/metrics"))
        .send()
        .await
        .expect("metrics")
        .json()
        .await
        .expect("metrics json");
    assert!(metrics["connections"]["accepted"].as_u64().unwrap() >= 1);
    assert_eq!(metrics["store_breaker"]["state"], "closed");
}
