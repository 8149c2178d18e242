//! Error Types
//!
//! Run-level failures are [`AgentError`]s and end a run. Failures scoped to a
//! single tool call are [`ToolErrorKind`] values carried inside a failed
//! `ToolResult` and are fed back to the model instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Knowledge retrieval failed and no degraded fallback is allowed
    #[error("Context assembly failed: {0}")]
    ContextAssembly(String),

    /// Model gateway kept failing after every retry
    #[error("Model unavailable after {attempts} attempt(s): {source}")]
    ModelUnavailable {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    /// Iteration bound hit; carries the latest assistant text, if any
    #[error("Iteration limit ({limit}) exceeded")]
    IterationLimitExceeded {
        limit: usize,
        partial_answer: Option<String>,
    },

    /// Session already has an active run
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// Session does not exist in the store
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Caller-initiated abort
    #[error("Run cancelled")]
    Cancelled,

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable by the caller (the run may be resumed)
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable { .. } | Self::SessionBusy(_) | Self::Io(_)
        )
    }

    /// Best partial answer carried by an iteration-limit failure
    pub fn partial_answer(&self) -> Option<&str> {
        match self {
            Self::IterationLimitExceeded { partial_answer, .. } => partial_answer.as_deref(),
            _ => None,
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::ContextAssembly(_) => {
                "The knowledge base is currently unreachable. Please try again.".into()
            }
            Self::ModelUnavailable { .. } => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::IterationLimitExceeded { partial_answer: Some(partial), .. } => {
                format!("The request needed too many steps. Best answer so far: {partial}")
            }
            Self::IterationLimitExceeded { .. } => {
                "The request took too many steps to process. Please try a simpler query.".into()
            }
            Self::SessionBusy(_) => {
                "This conversation is still processing a previous request.".into()
            }
            Self::SessionNotFound(_) => "The conversation could not be found.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Failure modes of a model gateway call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network or provider-side failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider refused the request for rate reasons
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider answered with something that could not be understood
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Per-call timeout elapsed
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Transport, rate-limit and timeout failures are worth another attempt
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited { .. } | Self::Timeout(_)
        )
    }
}

/// Why a single tool call failed. Never aborts the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ToolErrorKind {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool timed out after {0} ms")]
    ToolTimeout(u64),

    #[error("tool failed: {0}")]
    Execution(String),

    #[error("not executed: run cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_retryability() {
        assert!(GatewayError::Transport("reset".into()).is_retryable());
        assert!(GatewayError::RateLimited { retry_after: None }.is_retryable());
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!GatewayError::MalformedResponse("{".into()).is_retryable());
    }

    #[test]
    fn test_partial_answer_accessor() {
        let err = AgentError::IterationLimitExceeded {
            limit: 2,
            partial_answer: Some("about 4".into()),
        };
        assert_eq!(err.partial_answer(), Some("about 4"));
        assert!(err.user_message().contains("about 4"));
        assert_eq!(AgentError::Cancelled.partial_answer(), None);
    }

    #[test]
    fn test_tool_error_kind_serde() {
        let kind = ToolErrorKind::ToolTimeout(250);
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "tool_timeout", "detail": 250}));
        let cancelled = serde_json::to_value(ToolErrorKind::Cancelled).unwrap();
        assert_eq!(cancelled, serde_json::json!({"kind": "cancelled"}));
    }
}
