use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::broadcaster::BroadcastError;

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("room is full")]
    RoomFull,
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// 在线状态存储暂时不可用（已重试仍失败）
    #[error("presence store unavailable: {message}")]
    TransientStore {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),
}

impl ApplicationError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApplicationError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ApplicationError::NotFound(what.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApplicationError::Forbidden(message.into())
    }

    pub fn transient_store(message: impl Into<String>) -> Self {
        ApplicationError::TransientStore {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_store_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ApplicationError::TransientStore {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// 是否值得原地重试一次
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplicationError::TransientStore { .. })
    }

    /// 对外暴露的错误码，客户端按此分支处理
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::Validation(_) => "VALIDATION_ERROR",
            ApplicationError::NotFound(_) => "NOT_FOUND",
            ApplicationError::Forbidden(_) => "FORBIDDEN",
            ApplicationError::RoomFull => "ROOM_FULL",
            ApplicationError::RateLimited(_) => "RATE_LIMITED",
            ApplicationError::TransientStore { .. } => "STORE_UNAVAILABLE",
            ApplicationError::Repository(RepositoryError::NotFound) => "NOT_FOUND",
            ApplicationError::Repository(_) | ApplicationError::Broadcast(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        ApplicationError::Validation(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_error_kind() {
        assert_eq!(ApplicationError::RoomFull.code(), "ROOM_FULL");
        assert_eq!(
            ApplicationError::transient_store("down").code(),
            "STORE_UNAVAILABLE"
        );
        assert_eq!(
            ApplicationError::from(RepositoryError::NotFound).code(),
            "NOT_FOUND"
        );
        assert_eq!(
            ApplicationError::from(RepositoryError::storage("boom")).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn domain_errors_become_validation() {
        let err: ApplicationError = DomainError::invalid_argument("message", "cannot be empty").into();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(!err.is_transient());
    }
}
