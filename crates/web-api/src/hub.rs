//! 连接枢纽
//!
//! 独占整个 socket 群：连接记录、按房间的总线订阅（引用计数）、
//! 心跳存活检查与优雅排空。出站帧经每连接的写通道串行化，
//! 保证单连接内的帧顺序。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use application::bus::{channels, Bus, BusEvent, Subscription};
use application::cache::{keys, LayeredCache};
use application::clock::Clock;
use domain::{ConnectionId, MessageKind, RoomId, User, UserId};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::protocol::{ServerFrame, UserRef, WireMessage};

/// 心跳间隔；错过一轮 pong 的连接被终止。
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// 优雅排空的等待上限。
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// 每连接出站缓冲。
const OUTBOUND_BUFFER: usize = 64;

/// 写通道上的命令。
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Ping,
    Pong(Vec<u8>),
    Close { code: u16, reason: &'static str },
}

struct ConnectionEntry {
    sender: mpsc::Sender<Outbound>,
    remote_ip: String,
    authenticated: bool,
    user_id: Option<UserId>,
    username: Option<String>,
    room_id: Option<RoomId>,
    room_name: Option<String>,
    alive: bool,
    last_activity: Instant,
}

/// 调度器看到的连接状态快照。
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub authenticated: bool,
    pub user_id: Option<UserId>,
    pub username: Option<String>,
    pub room_id: Option<RoomId>,
    pub room_name: Option<String>,
}

struct RoomWatch {
    holders: usize,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ConnectionHub {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    watches: Mutex<HashMap<RoomId, RoomWatch>>,
    bus: Arc<dyn Bus>,
    cache: Arc<LayeredCache>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    draining: AtomicBool,
}

impl ConnectionHub {
    pub fn new(
        bus: Arc<dyn Bus>,
        cache: Arc<LayeredCache>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            bus,
            cache,
            clock,
            metrics,
            draining: AtomicBool::new(false),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    pub async fn register(
        &self,
        connection_id: ConnectionId,
        remote_ip: String,
        sender: mpsc::Sender<Outbound>,
    ) {
        let entry = ConnectionEntry {
            sender,
            remote_ip,
            authenticated: false,
            user_id: None,
            username: None,
            room_id: None,
            room_name: None,
            alive: true,
            last_activity: Instant::now(),
        };
        self.connections.write().await.insert(connection_id, entry);
    }

    pub async fn deregister(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        self.connections
            .write()
            .await
            .remove(&connection_id)
            .map(|entry| ConnectionSnapshot {
                authenticated: entry.authenticated,
                user_id: entry.user_id,
                username: entry.username,
                room_id: entry.room_id,
                room_name: entry.room_name,
            })
    }

    pub async fn snapshot(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|entry| ConnectionSnapshot {
                authenticated: entry.authenticated,
                user_id: entry.user_id,
                username: entry.username.clone(),
                room_id: entry.room_id,
                room_name: entry.room_name.clone(),
            })
    }

    pub async fn mark_authenticated(&self, connection_id: ConnectionId, user: &User) {
        if let Some(entry) = self.connections.write().await.get_mut(&connection_id) {
            entry.authenticated = true;
            entry.user_id = Some(user.id);
            entry.username = Some(user.username.as_str().to_owned());
        }
    }

    pub async fn set_room(&self, connection_id: ConnectionId, room: Option<(RoomId, String)>) {
        if let Some(entry) = self.connections.write().await.get_mut(&connection_id) {
            match room {
                Some((room_id, room_name)) => {
                    entry.room_id = Some(room_id);
                    entry.room_name = Some(room_name);
                }
                None => {
                    entry.room_id = None;
                    entry.room_name = None;
                }
            }
        }
    }

    pub async fn touch(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&connection_id) {
            entry.last_activity = Instant::now();
            entry.alive = true;
        }
    }

    pub async fn mark_alive(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&connection_id) {
            entry.alive = true;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn send_to(&self, connection_id: ConnectionId, frame: ServerFrame) {
        let sender = {
            let connections = self.connections.read().await;
            connections.get(&connection_id).map(|e| e.sender.clone())
        };
        if let Some(sender) = sender {
            if sender.send(Outbound::Frame(frame)).await.is_err() {
                debug!(connection_id = %connection_id, "outbound channel closed");
            }
        }
    }

    /// 房间内扇出；`exclude` 标记的用户（其全部连接）被跳过。
    pub async fn broadcast_to_room(
        &self,
        room_id: RoomId,
        frame: ServerFrame,
        exclude: Option<UserId>,
    ) {
        let targets: Vec<mpsc::Sender<Outbound>> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|e| e.room_id == Some(room_id))
                .filter(|e| match exclude {
                    Some(user_id) => e.user_id != Some(user_id),
                    None => true,
                })
                .map(|e| e.sender.clone())
                .collect()
        };
        for sender in targets {
            let _ = sender.send(Outbound::Frame(frame.clone())).await;
        }
    }

    pub async fn broadcast_all(&self, frame: ServerFrame) {
        let targets: Vec<mpsc::Sender<Outbound>> = {
            let connections = self.connections.read().await;
            connections.values().map(|e| e.sender.clone()).collect()
        };
        for sender in targets {
            let _ = sender.send(Outbound::Frame(frame.clone())).await;
        }
    }

    /// 本地第一个成员加入时订阅房间频道，引用计数。
    pub async fn watch_room(self: &Arc<Self>, room_id: RoomId) {
        let mut watches = self.watches.lock().await;
        if let Some(watch) = watches.get_mut(&room_id) {
            watch.holders += 1;
            return;
        }

        let mut tasks = Vec::new();
        for channel in [channels::room_messages(room_id), channels::room_events(room_id)] {
            match self.bus.subscribe(&channel).await {
                Ok(subscription) => {
                    let hub = self.clone();
                    tasks.push(tokio::spawn(async move {
                        hub.forward_room_events(room_id, subscription).await;
                    }));
                }
                Err(err) => {
                    warn!(room_id = %room_id, channel, error = %err, "room channel subscribe failed");
                }
            }
        }
        watches.insert(room_id, RoomWatch { holders: 1, tasks });
        debug!(room_id = %room_id, "房间频道已订阅");
    }

    /// 最后一个本地成员离开时退订。
    pub async fn unwatch_room(&self, room_id: RoomId) {
        let mut watches = self.watches.lock().await;
        if let Some(watch) = watches.get_mut(&room_id) {
            watch.holders = watch.holders.saturating_sub(1);
            if watch.holders == 0 {
                if let Some(watch) = watches.remove(&room_id) {
                    for task in watch.tasks {
                        task.abort();
                    }
                }
                debug!(room_id = %room_id, "房间频道已退订");
            }
        }
    }

    async fn forward_room_events(&self, room_id: RoomId, mut subscription: Subscription) {
        while let Some(envelope) = subscription.recv().await {
            let exclude = envelope.exclude_user;
            let frame = match envelope.event {
                BusEvent::Message { message } => match message.kind {
                    MessageKind::Notification => ServerFrame::Notification {
                        message: WireMessage::from(&message),
                    },
                    _ => ServerFrame::Message {
                        message: WireMessage::from(&message),
                    },
                },
                BusEvent::UserJoined {
                    user_id,
                    username,
                    member_count,
                    ..
                } => ServerFrame::UserJoined {
                    user: UserRef {
                        user_id: user_id.to_string(),
                        username,
                    },
                    member_count,
                },
                BusEvent::UserLeft {
                    user_id,
                    username,
                    member_count,
                    ..
                } => ServerFrame::UserLeft {
                    user: UserRef {
                        user_id: user_id.to_string(),
                        username,
                    },
                    member_count,
                },
                BusEvent::TypingUpdate { typing_users, .. } => {
                    ServerFrame::TypingUpdate { typing_users }
                }
                BusEvent::MessageEdited { message } => ServerFrame::MessageEdited {
                    message: WireMessage::from(&message),
                },
                BusEvent::MessageDeleted {
                    room_id,
                    message_id,
                } => ServerFrame::MessageDeleted {
                    room_id: room_id.to_string(),
                    message_id: message_id.to_string(),
                },
                // 这些事件不在房间频道上流动
                BusEvent::RoomCreated { .. } | BusEvent::Broadcast { .. } => continue,
            };
            self.broadcast_to_room(room_id, frame, exclude).await;
        }
    }

    /// 全局频道：系统广播扇出到所有连接，`room:created`
    /// 让本实例的活跃房间列表缓存失效。
    pub fn spawn_global_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut global = match hub.bus.subscribe(channels::GLOBAL_BROADCAST).await {
                Ok(sub) => sub,
                Err(err) => {
                    warn!(error = %err, "global channel subscribe failed");
                    return;
                }
            };
            let mut created = match hub.bus.subscribe(channels::ROOM_CREATED).await {
                Ok(sub) => sub,
                Err(err) => {
                    warn!(error = %err, "room:created subscribe failed");
                    return;
                }
            };

            loop {
                tokio::select! {
                    envelope = global.recv() => {
                        match envelope {
                            Some(envelope) => {
                                if let BusEvent::Broadcast { content } = envelope.event {
                                    hub.broadcast_all(ServerFrame::System { message: content }).await;
                                }
                            }
                            None => break,
                        }
                    }
                    envelope = created.recv() => {
                        match envelope {
                            Some(envelope) => {
                                if let BusEvent::RoomCreated { room_id, name } = envelope.event {
                                    debug!(room_id = %room_id, name = %name, "room created elsewhere");
                                    hub.cache.invalidate(keys::ACTIVE_ROOMS, false).await;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        })
    }

    /// 心跳：每轮 ping 所有连接；上一轮没有应答的连接被终止。
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hub.heartbeat_round().await;
            }
        })
    }

    async fn heartbeat_round(&self) {
        let mut terminated = 0usize;
        {
            let mut connections = self.connections.write().await;
            for (connection_id, entry) in connections.iter_mut() {
                if !entry.alive {
                    terminated += 1;
                    info!(connection_id = %connection_id, remote = %entry.remote_ip, "心跳超时，断开连接");
                    let _ = entry.sender.try_send(Outbound::Close {
                        code: 1001,
                        reason: "heartbeat timeout",
                    });
                } else {
                    entry.alive = false;
                    let _ = entry.sender.try_send(Outbound::Ping);
                }
            }
        }
        if terminated > 0 {
            debug!(terminated, "heartbeat sweep finished");
        }
    }

    /// 优雅排空：对全部连接发 1001，等待至多 5 秒。
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
        {
            let connections = self.connections.read().await;
            info!(connections = connections.len(), "开始排空连接");
            for entry in connections.values() {
                let _ = entry.sender.try_send(Outbound::Close {
                    code: 1001,
                    reason: "server shutting down",
                });
            }
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            if self.connections.read().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.connections.read().await.len();
        if leftover > 0 {
            warn!(leftover, "排空超时，仍有连接未关闭");
        }
    }
}
