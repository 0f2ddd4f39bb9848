//! 聊天服务核心领域模型
//!
//! 包含用户、房间、成员关系、消息等核心实体，以及内容净化与验证规则。

pub mod chat_room;
pub mod errors;
pub mod message;
pub mod room_member;
pub mod sanitize;
pub mod user;
pub mod value_objects;

// 重新导出常用类型
pub use chat_room::ChatRoom;
pub use errors::{DomainError, DomainResult, ErrorCode, RepositoryError, RepositoryResult};
pub use message::{Message, MessageKind};
pub use room_member::RoomMember;
pub use user::{User, MAX_ROOMS_JOINED};
pub use value_objects::{
    ConnectionId, MessageId, RoomId, RoomName, Timestamp, UserId, Username,
};
