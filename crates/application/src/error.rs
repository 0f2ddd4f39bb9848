use std::error::Error as StdError;

use domain::{DomainError, ErrorCode, RepositoryError};
use thiserror::Error;

use crate::bus::BusError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("infrastructure error: {message}")]
    Infrastructure {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
    #[error("authentication required")]
    Unauthorized,
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: None,
        }
    }

    pub fn infrastructure_with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// 映射到线上错误码；服务层已把业务性的存储结果
    /// （NotFound/Conflict）翻译成领域错误，落到这里的
    /// Repository 变体都是真正的存储故障。
    pub fn code(&self) -> ErrorCode {
        match self {
            ApplicationError::Domain(e) => e.code(),
            ApplicationError::Repository(_) => ErrorCode::DatabaseError,
            ApplicationError::Unauthorized => ErrorCode::Unauthorized,
            ApplicationError::Bus(_) | ApplicationError::Infrastructure { .. } => {
                ErrorCode::InternalError
            }
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}

pub type ApplicationResult<T> = Result<T, ApplicationError>;
