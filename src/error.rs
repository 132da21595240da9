// Error taxonomy shared by every backend operation

use serde::ser::SerializeStruct;
use serde::Serialize;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Typed outcome of a failed command.
///
/// Every variant leaves persisted state and the current-session pointer as
/// they were before the failing call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Bad input from the caller (empty prompt, no model selected, ...).
    #[error("{0}")]
    Validation(String),

    /// The referenced chat session does not exist.
    #[error("chat session {0} not found")]
    NotFound(i64),

    /// A generation is already in flight.
    #[error("a response is already being generated")]
    Busy,

    /// The in-flight generation was aborted by the user.
    #[error("generation cancelled")]
    Cancelled,

    /// The inference endpoint was unreachable or answered with something unusable.
    #[error("ollama request failed: {0}")]
    Upstream(String),

    /// The local database failed.
    #[error("database error: {0}")]
    Persistence(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Stable tag for the presentation layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Upstream(_) => "upstream",
            Self::Persistence(_) => "persistence",
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Upstream(format!("malformed response: {}", err))
    }
}

impl Serialize for ChatError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ChatError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
