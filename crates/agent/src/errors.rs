use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use bazaar_core::errors::ApplicationError;
use bazaar_db::RepositoryError;

/// Failure of one call to the generative text backend.
///
/// None of these reach a caller: the loop turns them into persona fallback text
/// and the annotator into an empty rationale.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend quota exhausted: {0}")]
    Quota(String),
    #[error("malformed backend output: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "backend_unavailable",
            Self::Timeout(_) => "backend_timeout",
            Self::Quota(_) => "backend_quota",
            Self::Malformed(_) => "malformed_backend_output",
        }
    }
}

/// Precondition failure inside a tool handler. Relayed to the backend as data.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("item {0} not found")]
    ItemNotFound(i64),
    #[error("user not found")]
    UserNotFound,
    #[error("insufficient balance: required {required}, balance {balance}")]
    InsufficientBalance { required: i64, balance: i64 },
    #[error("no personas available to draw")]
    EmptyCatalog,
    #[error("tool `{tool}` not permitted: {reason}")]
    NotPermitted { tool: String, reason: String },
    #[error("store failure: {0}")]
    Store(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::ItemNotFound(_) => "item_not_found",
            Self::UserNotFound => "user_not_found",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::EmptyCatalog => "empty_catalog",
            Self::NotPermitted { .. } => "tool_not_permitted",
            Self::Store(_) => "store_unavailable",
        }
    }

    /// Structured payload handed back to the backend in place of a result.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({ "error": self.code(), "message": self.to_string() });
        match self {
            Self::InsufficientBalance { required, balance } => {
                payload["required"] = json!(required);
                payload["balance"] = json!(balance);
            }
            Self::NotPermitted { reason, .. } => {
                payload["reason"] = json!(reason);
            }
            Self::UnknownTool(name) => {
                payload["tool"] = json!(name);
            }
            _ => {}
        }
        payload
    }
}

impl From<RepositoryError> for ToolError {
    fn from(error: RepositoryError) -> Self {
        Self::Store(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("text backend configuration: {0}")]
    BackendConfig(BackendError),
}

impl From<AgentError> for ApplicationError {
    fn from(error: AgentError) -> Self {
        match error {
            AgentError::InvalidInput(message) => {
                ApplicationError::Domain(bazaar_core::DomainError::InvalidInput(message))
            }
            AgentError::Repository(error) => ApplicationError::Persistence(error.to_string()),
            AgentError::BackendConfig(error) => ApplicationError::Configuration(error.to_string()),
        }
    }
}
