use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// 网关计数器；`/metrics` 直接读取。
#[derive(Default)]
pub struct Metrics {
    pub connections_accepted: AtomicU64,
    pub connections_current: AtomicI64,
    pub authentications: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub messages_sent: AtomicU64,
    pub rooms_created: AtomicU64,
    pub errors: AtomicU64,
    pub frames_auth: AtomicU64,
    pub frames_create_room: AtomicU64,
    pub frames_join_room: AtomicU64,
    pub frames_leave_room: AtomicU64,
    pub frames_send_message: AtomicU64,
    pub frames_typing: AtomicU64,
    pub frames_command: AtomicU64,
}

impl Metrics {
    pub fn record_frame(&self, kind: &str) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            "auth" => &self.frames_auth,
            "create_room" => &self.frames_create_room,
            "join_room" => &self.frames_join_room,
            "leave_room" => &self.frames_leave_room,
            "send_message" => &self.frames_send_message,
            "typing_start" | "typing_stop" => &self.frames_typing,
            "command" => &self.frames_command,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "connections": {
                "accepted": self.connections_accepted.load(Ordering::Relaxed),
                "current": self.connections_current.load(Ordering::Relaxed),
                "authenticated": self.authentications.load(Ordering::Relaxed),
            },
            "frames": {
                "in": self.frames_in.load(Ordering::Relaxed),
                "out": self.frames_out.load(Ordering::Relaxed),
                "auth": self.frames_auth.load(Ordering::Relaxed),
                "create_room": self.frames_create_room.load(Ordering::Relaxed),
                "join_room": self.frames_join_room.load(Ordering::Relaxed),
                "leave_room": self.frames_leave_room.load(Ordering::Relaxed),
                "send_message": self.frames_send_message.load(Ordering::Relaxed),
                "typing": self.frames_typing.load(Ordering::Relaxed),
                "command": self.frames_command.load(Ordering::Relaxed),
            },
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "rooms_created": self.rooms_created.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
        })
    }
}
