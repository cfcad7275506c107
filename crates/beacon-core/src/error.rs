//! Application error types with rich context

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────
    #[error("No session has been established")]
    NoSession,

    #[error("Request timed out after {waited_ms}ms")]
    RequestTimeout { waited_ms: u64 },

    #[error("Invalid session state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // ─────────────────────────────────────────────────────────────
    // Dispatch/Server Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Tracking is disabled; request was not sent")]
    TrackingDisabled,

    #[error("A link for these parameters already exists")]
    DuplicateLink,

    #[error("Server rejected request with status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    // ─────────────────────────────────────────────────────────────
    // Queue/Channel Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Request queue has been shut down")]
    QueueShutdown,

    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid app key: {0}")]
    InvalidKey(String),
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn timeout(waited_ms: u64) -> Self {
        Self::RequestTimeout { waited_ms }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey(key.into())
    }

    /// Check if a fresh attempt at the same request could succeed.
    ///
    /// Transport-level failures and server 5xx responses are retryable;
    /// client errors and terminal SDK states are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } => true,
            Error::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Check if this error ends the operation permanently
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::NoSession
                | Error::RequestTimeout { .. }
                | Error::TrackingDisabled
                | Error::DuplicateLink
                | Error::QueueShutdown
                | Error::InvalidKey(_)
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
