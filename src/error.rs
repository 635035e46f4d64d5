use thiserror::Error;

/// Domain errors surfaced by the gradebook engine and the HTTP API
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GradebookError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl GradebookError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

impl From<std::io::Error> for GradebookError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for GradebookError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GradebookError>;
