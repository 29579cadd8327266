//! Error types for the opsagent runtime

use crate::types::ChatMessage;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the runtime.
///
/// Only faults that prevent forward progress surface as `Error`. Tool-level
/// failures (unknown tool, bad parameters, a tool returning an error) are
/// in-band [`StructuredToolResult`](crate::StructuredToolResult) values and
/// never abort the loop.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration (bad toolset config, unknown model, missing credentials)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Error reported by the LLM provider.
    ///
    /// `transient` controls retry behavior: connection failures, 429 and 5xx
    /// responses are retried with backoff, everything else fails immediately.
    #[error("LLM provider error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Provider {
        message: String,
        status: Option<u16>,
        transient: bool,
    },

    /// The message set cannot be made to fit the context window, even after
    /// truncation and compaction. Carries the history for inspection.
    #[error("context window exceeded after truncation and compaction ({} messages retained)", .messages.len())]
    ContextExceeded { messages: Vec<ChatMessage> },

    /// The caller cancelled the run or the deadline elapsed. Carries the
    /// history as of the last fully-completed iteration.
    #[error("run cancelled ({} messages retained)", .messages.len())]
    Cancelled { messages: Vec<ChatMessage> },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a transient provider error (will be retried)
    pub fn provider_transient(msg: impl Into<String>, status: Option<u16>) -> Self {
        Error::Provider {
            message: msg.into(),
            status,
            transient: true,
        }
    }

    /// Create a permanent provider error (fails immediately)
    pub fn provider_permanent(msg: impl Into<String>, status: Option<u16>) -> Self {
        Error::Provider {
            message: msg.into(),
            status,
            transient: false,
        }
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Whether this fault is worth retrying: HTTP transport failures and
    /// provider errors flagged transient (connection reset, 429, 5xx).
    /// Configuration and input errors never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Provider { transient, .. } => *transient,
            _ => false,
        }
    }

    /// The message history attached to this error, if any.
    ///
    /// `ContextExceeded` and `Cancelled` keep the in-memory history so
    /// callers can inspect how far the investigation got.
    pub fn messages(&self) -> Option<&[ChatMessage]> {
        match self {
            Error::ContextExceeded { messages } | Error::Cancelled { messages } => Some(messages),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("Invalid model");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Invalid configuration: Invalid model");
    }

    #[test]
    fn test_error_provider_display() {
        let err = Error::provider_transient("too many requests", Some(429));
        assert_eq!(
            err.to_string(),
            "LLM provider error (429): too many requests"
        );

        let err = Error::provider_permanent("bad request", None);
        assert_eq!(err.to_string(), "LLM provider error: bad request");
    }

    #[test]
    fn test_error_provider_transient_flag() {
        let transient = Error::provider_transient("503", Some(503));
        assert!(matches!(
            transient,
            Error::Provider {
                transient: true,
                ..
            }
        ));

        let permanent = Error::provider_permanent("schema mismatch", Some(400));
        assert!(matches!(
            permanent,
            Error::Provider {
                transient: false,
                ..
            }
        ));
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::provider_transient("429", Some(429)).is_transient());
        assert!(!Error::provider_permanent("400", Some(400)).is_transient());
        assert!(!Error::config("bad model").is_transient());
        assert!(!Error::invalid_input("bad input").is_transient());
    }

    #[test]
    fn test_error_messages_attachment() {
        let history = vec![ChatMessage::user("hello")];
        let err = Error::Cancelled {
            messages: history.clone(),
        };
        assert_eq!(err.messages().unwrap().len(), 1);

        let err = Error::ContextExceeded { messages: history };
        assert_eq!(err.messages().unwrap().len(), 1);

        assert!(Error::other("x").messages().is_none());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
