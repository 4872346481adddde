//! 领域层统一错误定义
//!
//! 聚焦消息持久化、并发控制、投递与存储连接的最小必要集合，
//! 便于在各实现层统一转换为 `DomainError`。
//!
use thiserror::Error;

/// 统一错误类型（消息持久化最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 序列化/解析 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("parse error: {reason}")]
    Parse { reason: String },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },

    // --- 仓储/持久化 ---
    #[error("not found: {reason}")]
    NotFound { reason: String },
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("concurrency conflict: {reason}")]
    Concurrency { reason: String },
    #[error("transient store error: {reason}")]
    TransientStore { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },

    // --- 投递 ---
    #[error("dispatch error: target={target}, reason={reason}")]
    Dispatch { target: String, reason: String },

    // --- 状态机 ---
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    pub fn not_found(reason: impl Into<String>) -> Self {
        DomainError::NotFound {
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        DomainError::Conflict {
            reason: reason.into(),
        }
    }

    pub fn concurrency(reason: impl Into<String>) -> Self {
        DomainError::Concurrency {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        DomainError::TransientStore {
            reason: reason.into(),
        }
    }

    pub fn dispatch(target: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainError::Dispatch {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        DomainError::InvalidState {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DomainError::Conflict { .. })
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, DomainError::Concurrency { .. })
    }

    /// 连接级故障，可在存储层退避重试
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::TransientStore { .. })
    }
}

// ---- Cross-crate conversions for infrastructure convenience ----
// 允许在基础设施层直接使用 `?` 将 sqlx/uuid 等错误转换为 DomainError

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DomainError::NotFound {
                reason: "row not found".to_string(),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DomainError::TransientStore {
                reason: err.to_string(),
            },
            other => DomainError::Database {
                reason: other.to_string(),
            },
        }
    }
}

impl From<uuid::Error> for DomainError {
    fn from(err: uuid::Error) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<std::num::TryFromIntError> for DomainError {
    fn from(err: std::num::TryFromIntError) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        assert!(DomainError::not_found("m-1").is_not_found());
        assert!(DomainError::conflict("m-1").is_conflict());
        assert!(DomainError::concurrency("m-1").is_concurrency());
        assert!(DomainError::transient("socket closed").is_transient());
        assert!(!DomainError::dispatch("broker", "down").is_transient());
    }

    #[test]
    fn serde_error_converts() {
        let err = serde_json::from_str::<u32>("not-a-number").unwrap_err();
        let err: DomainError = err.into();
        assert!(matches!(err, DomainError::Serde { .. }));
    }
}
