use thiserror::Error;

/// Errors raised by workspace operations.
///
/// `Validation`, `NotFound` and `Cycle` are detected before anything is
/// mutated. `Binding` is recoverable at render time. `Persistence` never
/// aborts an in-memory mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Cycle detected: {0}")]
    Cycle(String),
    #[error("Binding error: {0}")]
    Binding(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{what} '{id}'"))
    }

    pub fn binding(message: impl Into<String>) -> Self {
        Self::Binding(message.into())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(value: serde_json::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
