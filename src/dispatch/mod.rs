pub mod batch;
pub mod http;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FailureKind, FarmError};

/// One turn of a conversation, OpenAI chat format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Call parameters shared by every request in a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallParams {
    pub model: String,
    /// Sampling temperature (0 = deterministic).
    pub temperature: f64,
    pub max_tokens: u32,
}

impl CallParams {
    pub fn new(model: impl Into<String>, temperature: f64, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            temperature,
            max_tokens,
        }
    }

    /// Reject parameters that can never produce a valid request.
    pub fn validate(&self) -> Result<(), FarmError> {
        if self.model.trim().is_empty() {
            return Err(FarmError::InvalidBatch("model must not be empty".to_string()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(FarmError::InvalidBatch(format!(
                "temperature must be a finite non-negative number, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(FarmError::InvalidBatch("max_tokens must be positive".to_string()));
        }
        Ok(())
    }
}

/// Single-request operation the batch dispatcher drives.
///
/// Implementations must tolerate being dropped mid-flight: the dispatcher
/// abandons a call by dropping its future on timeout or cancellation.
pub trait ChatBackend: Send + Sync + 'static {
    fn call(
        &self,
        messages: &[ChatMessage],
        params: &CallParams,
    ) -> impl Future<Output = Result<Value, FarmError>> + Send;
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A captured per-request failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub index: usize,
    pub kind: FailureKind,
    pub message: String,
}

impl CallFailure {
    pub fn from_error(index: usize, err: &FarmError) -> Self {
        Self {
            index,
            kind: err.failure_kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request {} failed ({}): {}", self.index, self.kind, self.message)
    }
}

impl std::error::Error for CallFailure {}

/// Result for one request slot.
pub type Outcome = Result<Value, CallFailure>;

/// True if the outcome is a response carrying a `choices` field.
pub fn outcome_is_success(outcome: &Outcome) -> bool {
    matches!(outcome, Ok(v) if v.get("choices").is_some())
}
