//! Error kinds for the execution engine.
//!
//! Only request validation surfaces to callers as an `Err`. Everything that
//! happens once an execution runs is folded into outcomes, warnings or the
//! terminal status.

use std::time::Duration;

use crate::gateway::ProviderError;

/// Errors returned before an execution starts.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

/// Why one attempt at a task failed.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The AI platform returned an error.
    #[error("call failed: {0}")]
    Call(#[from] ProviderError),
    /// The per-call timeout elapsed before the platform answered.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// The answer came back but could not be parsed.
    #[error("parse failed: {0}")]
    Parse(String),
}

impl TaskError {
    /// Timeouts and parse failures are transient; provider errors decide for themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Call(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::Parse(_) => true,
        }
    }

    /// Wait requested by the platform, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Call(e) => e.retry_after(),
            Self::Timeout(_) | Self::Parse(_) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Call(e) => e.code(),
            Self::Timeout(_) => "timeout",
            Self::Parse(_) => "parse_error",
        }
    }
}

/// Report construction failed; the collector degrades instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("aggregation failed: {0}")]
    Aggregation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_task_errors_are_retryable() {
        assert!(TaskError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TaskError::Parse("no json".into()).is_retryable());
        assert!(!TaskError::Call(ProviderError::unknown_model("x")).is_retryable());
        assert_eq!(TaskError::Parse("x".into()).code(), "parse_error");
    }

    #[test]
    fn only_throttled_calls_request_a_wait() {
        let throttled = TaskError::Call(ProviderError::throttled(
            Duration::from_secs(4),
            crate::gateway::ErrorContext::http(429, None),
        ));
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(4)));
        assert_eq!(throttled.code(), "throttled");
        assert_eq!(TaskError::Timeout(Duration::from_secs(1)).retry_after(), None);
    }
}
