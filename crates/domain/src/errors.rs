//! 领域模型错误定义
//!
//! 定义了消息平面中所有可能的错误类型，并提供到线上错误码的映射。

use std::error::Error as StdError;

use thiserror::Error;

/// 线上协议错误码
///
/// 每个发给客户端的 `error` 帧都携带其中之一。
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "INVALID_MESSAGE")]
    InvalidMessage,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "ROOM_NOT_FOUND")]
    RoomNotFound,
    #[serde(rename = "ROOM_EXISTS")]
    RoomExists,
    /// 预留给与重连语义不同的用户名冲突，当前认证流程不会触发。
    #[serde(rename = "USER_EXISTS")]
    UserExists,
    #[serde(rename = "RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::RoomExists => "ROOM_EXISTS",
            ErrorCode::UserExists => "USER_EXISTS",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    Validation { field: String, message: String },

    /// 内容被拒绝（注入形态、垃圾消息等）
    #[error("内容被拒绝: {reason}")]
    ContentRejected { reason: String },

    /// 房间不存在或已停用
    #[error("房间不存在: {name}")]
    RoomNotFound { name: String },

    /// 房间名冲突
    #[error("房间已存在: {name}")]
    RoomExists { name: String },

    /// 操作不被允许
    #[error("操作不允许: {action}")]
    OperationNotAllowed { action: String },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建内容拒绝错误
    pub fn content_rejected(reason: impl Into<String>) -> Self {
        Self::ContentRejected {
            reason: reason.into(),
        }
    }

    pub fn room_not_found(name: impl Into<String>) -> Self {
        Self::RoomNotFound { name: name.into() }
    }

    pub fn room_exists(name: impl Into<String>) -> Self {
        Self::RoomExists { name: name.into() }
    }

    pub fn not_allowed(action: impl Into<String>) -> Self {
        Self::OperationNotAllowed {
            action: action.into(),
        }
    }

    /// 映射到线上错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            DomainError::Validation { .. } | DomainError::ContentRejected { .. } => {
                ErrorCode::InvalidMessage
            }
            DomainError::RoomNotFound { .. } => ErrorCode::RoomNotFound,
            DomainError::RoomExists { .. } => ErrorCode::RoomExists,
            DomainError::OperationNotAllowed { .. } => ErrorCode::Unauthorized,
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 持久化层错误
///
/// 基础设施实现（Postgres / 内存）都收敛到这组变体；
/// `NotFound` 与 `Conflict` 属于业务结果，不计入熔断统计。
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("记录不存在")]
    NotFound,
    #[error("唯一约束冲突")]
    Conflict,
    #[error("存储不可用（熔断开启）")]
    Unavailable,
    #[error("存储操作超时")]
    Timeout,
    #[error("存储错误: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// 是否属于基础设施故障（驱动熔断器计数）
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            RepositoryError::Unavailable | RepositoryError::Timeout | RepositoryError::Storage { .. }
        )
    }
}

/// 持久化层结果类型
pub type RepositoryResult<T> = Result<T, RepositoryError>;
