//! Error types for toolguard

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolguard_core::FailureClass;

/// Result type alias for toolguard
pub type Result<T> = std::result::Result<T, Error>;

/// toolguard errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool id not present in the tool table
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Timeout, connection reset and other retry-eligible tool failures
    #[error("Transient tool error ({tool}): {message}")]
    TransientTool {
        /// Tool id
        tool: String,
        /// Adapter-supplied message
        message: String,
    },

    /// Malformed input, auth failure and other non-retryable tool failures
    #[error("Permanent tool error ({tool}): {message}")]
    PermanentTool {
        /// Tool id
        tool: String,
        /// Adapter-supplied message
        message: String,
    },

    /// Call denied by an open breaker
    #[error("Circuit breaker for '{tool}' is open, retry in {}ms", retry_after.as_millis())]
    BreakerOpen {
        /// Tool id
        tool: String,
        /// Time until the breaker admits a probe
        retry_after: Duration,
    },

    /// Every degradation strategy was inapplicable for an abort-tier tool
    #[error("Fallback exhausted for '{tool}': {reason}")]
    FallbackExhausted {
        /// Tool id
        tool: String,
        /// Audit trail of why each strategy did not apply
        reason: String,
    },

    /// Alert delivery failure
    #[error("Notification error ({destination}): {message}")]
    Notify {
        /// Destination name
        destination: String,
        /// Failure detail
        message: String,
    },

    /// Breaker state persistence failure
    #[error("Persistence error: {0}")]
    Persist(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry could plausibly succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientTool { .. } | Self::Notify { .. } | Self::Http(_) | Self::Io(_)
        )
    }

    /// Short machine-readable kind, used as a metrics label
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::UnknownTool(_) => "unknown_tool",
            Self::TransientTool { .. } => "transient",
            Self::PermanentTool { .. } => "permanent",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::FallbackExhausted { .. } => "fallback_exhausted",
            Self::Notify { .. } => "notify",
            Self::Persist(_) => "persist",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Http(_) => "http",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error payload of a tool invocation, classified by the calling adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    /// Transient or permanent
    pub class: FailureClass,
    /// Human-readable detail
    pub message: String,
}

impl ToolError {
    /// A retry-eligible failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    /// A failure that must not be retried
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    /// Whether a retry could succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }

    /// Lift into the crate-wide taxonomy
    #[must_use]
    pub fn into_error(self, tool: &str) -> Error {
        match self.class {
            FailureClass::Transient => Error::TransientTool {
                tool: tool.to_string(),
                message: self.message,
            },
            FailureClass::Permanent => Error::PermanentTool {
                tool: tool.to_string(),
                message: self.message,
            },
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class.as_str(), self.message)
    }
}
