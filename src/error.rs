use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Failure categories a model backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Connectivity,
    Auth,
    RateLimited,
    MalformedResponse,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendErrorKind::Connectivity => "connectivity",
            BackendErrorKind::Auth => "auth",
            BackendErrorKind::RateLimited => "rate limited",
            BackendErrorKind::MalformedResponse => "malformed response",
            BackendErrorKind::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool `{tool}` has unsupported parameter `{parameter}`: {reason}")]
    UnsupportedSignature {
        tool: String,
        parameter: String,
        reason: String,
    },

    #[error("tool `{0}` not found")]
    UnknownTool(String),

    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),

    #[error("tool `{name}` invocation failed: {source}")]
    ToolExecution {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid arguments for tool `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("middleware `{hook}` rejected call to `{tool}`: {reason}")]
    MiddlewareAbort {
        hook: String,
        tool: String,
        reason: String,
    },

    #[error("model backend error ({kind}): {message}")]
    Backend {
        kind: BackendErrorKind,
        message: String,
    },

    #[error("invalid history: {0}")]
    InvalidHistory(String),

    #[error("turn cancelled while awaiting the model")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn backend(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        AgentError::Backend {
            kind,
            message: message.into(),
        }
    }

    pub fn tool_failure(
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        AgentError::ToolExecution {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Errors the tool executor turns into conversation data instead of propagating.
    pub fn is_tool_local(&self) -> bool {
        matches!(
            self,
            AgentError::UnknownTool(_)
                | AgentError::ToolExecution { .. }
                | AgentError::InvalidArguments { .. }
                | AgentError::MiddlewareAbort { .. }
        )
    }

    pub fn backend_kind(&self) -> Option<BackendErrorKind> {
        match self {
            AgentError::Backend { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_tool_local_errors() {
        assert!(AgentError::UnknownTool("x".into()).is_tool_local());
        assert!(AgentError::tool_failure("x", "boom").is_tool_local());
        assert!(!AgentError::Cancelled.is_tool_local());
        assert!(!AgentError::backend(BackendErrorKind::Auth, "denied").is_tool_local());
    }

    #[test]
    fn backend_errors_keep_their_kind() {
        let err = AgentError::backend(BackendErrorKind::MalformedResponse, "no choices");
        assert_eq!(err.backend_kind(), Some(BackendErrorKind::MalformedResponse));
        assert_eq!(
            err.to_string(),
            "model backend error (malformed response): no choices"
        );
    }
}
