use outbox_domain::error::DomainError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("domain: {0}")]
    Domain(#[from] DomainError),

    #[error("validation: {0}")]
    Validation(String),

    #[error("infra: {0}")]
    Infra(String),

    #[error("handler not found: {0}")]
    HandlerNotFound(String),

    #[error("handler already registered: command={command}")]
    AlreadyRegisteredCommand { command: &'static str },

    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },

    #[error("configuration: {0}")]
    Configuration(#[from] config::ConfigError),
}

impl AppError {
    /// 转为领域层投递错误，供分发端口返回
    pub(crate) fn into_dispatch(self, target: &str) -> DomainError {
        match self {
            AppError::Domain(err) => err,
            other => DomainError::dispatch(target, other.to_string()),
        }
    }
}
