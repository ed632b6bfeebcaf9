use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FarmError {
    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("rate limited by {server}")]
    RateLimited { server: String },

    #[error("upstream error from {server}: {message}")]
    Upstream {
        server: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {server}: {message}")]
    AuthFailed { server: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Failure taxonomy recorded in a result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection or network-level error reaching the server.
    Transport,
    /// The call did not finish within the per-request timeout.
    Timeout,
    /// The server answered, but with an error.
    Remote,
    /// The batch was cancelled before this call finished.
    Cancelled,
    /// The task running this call panicked.
    Panicked,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Remote => "remote",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FarmError {
    /// Map onto the per-slot failure taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled(_) => FailureKind::Cancelled,
            Self::Request(e) if e.is_timeout() => FailureKind::Timeout,
            Self::Request(_) => FailureKind::Transport,
            Self::RateLimited { .. }
            | Self::Upstream { .. }
            | Self::AuthFailed { .. }
            | Self::SchemaParse(_) => FailureKind::Remote,
            // Only reachable if a backend returns them from a call.
            Self::InvalidBatch(_) | Self::Config(_) | Self::Other(_) => FailureKind::Remote,
        }
    }

    /// Returns true for transient errors that may succeed on resubmission.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            Self::Upstream { status, .. } => {
                // status: None = not from HTTP (oversized body, bad payload) → permanent
                status.is_some_and(|s| s >= 500)
            }
            Self::Request(_) => true,
            _ => false,
        }
    }

    /// Sanitized message: no URLs, connection details, or upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled(ms) => format!("cancelled after {ms}ms"),
            Self::RateLimited { server } => format!("rate limited by {server}"),
            Self::Upstream {
                server, status, ..
            } => match status {
                Some(s) => format!("upstream error from {server}: HTTP {s}"),
                None => format!("upstream error from {server}"),
            },
            Self::AuthFailed { server, message } => {
                format!("authentication failed for {server}: {message}")
            }
            Self::SchemaParse(_) => "failed to parse server response".to_string(),
            Self::Request(_) => "request to server failed".to_string(),
            Self::InvalidBatch(msg) => format!("invalid batch: {msg}"),
            Self::Config(msg) => format!("config error: {msg}"),
            Self::Other(msg) => msg.clone(),
        }
    }
}
