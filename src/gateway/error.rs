//! Failures of one call to an AI chat platform.
//!
//! The runner only needs two answers from an error: may the call be retried,
//! and how long should it wait first. Everything else is for logs.

use std::time::Duration;
use thiserror::Error;

/// Diagnostics the platform returned alongside a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Platform error code, e.g. `rate_limit_exceeded`.
    pub provider_code: Option<String>,
    /// `x-request-id` of the failed call.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn http(status: u16, request_id: Option<String>) -> Self {
        Self {
            http_status: Some(status),
            provider_code: None,
            request_id,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// No client can be built for this model name.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// The platform throttled the call and asked us to wait.
    #[error("throttled by platform, retry after {retry_after:?}")]
    Throttled {
        retry_after: Duration,
        context: ErrorContext,
    },

    /// The prompt was rejected before it was sent.
    #[error("prompt rejected: {0}")]
    PromptRejected(String),

    /// The model declined to answer the brand question.
    #[error("model refused: {0}")]
    Refused(String),

    /// Anything else the platform reported; it decides retryability.
    #[error("platform error: {message}")]
    Platform {
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing or malformed client settings, such as the API key.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn unknown_model(model: impl Into<String>) -> Self {
        Self::UnknownModel(model.into())
    }

    pub fn throttled(retry_after: Duration, context: ErrorContext) -> Self {
        Self::Throttled {
            retry_after,
            context,
        }
    }

    pub fn prompt_rejected(message: impl Into<String>) -> Self {
        Self::PromptRejected(message.into())
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused(message.into())
    }

    pub fn platform(message: impl Into<String>, retryable: bool) -> Self {
        Self::Platform {
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn platform_with_context(
        message: impl Into<String>,
        retryable: bool,
        context: ErrorContext,
    ) -> Self {
        Self::Platform {
            message: message.into(),
            retryable,
            context: Some(context),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled { .. } => true,
            Self::Platform { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::UnknownModel(_) | Self::PromptRejected(_) | Self::Refused(_) | Self::Config(_) => {
                false
            }
        }
    }

    /// Minimum wait the platform asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short code for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "unknown_model",
            Self::Throttled { .. } => "throttled",
            Self::PromptRejected(_) => "prompt_rejected",
            Self::Refused(_) => "refused",
            Self::Platform { .. } => "platform_error",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Throttled { context, .. } => Some(context),
            Self::Platform { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_platform_failures_are_retryable() {
        let throttled = ProviderError::throttled(Duration::from_secs(1), ErrorContext::default());
        assert!(throttled.is_retryable());
        assert!(ProviderError::platform("502", true).is_retryable());
        assert!(!ProviderError::platform("bad json", false).is_retryable());
        assert!(!ProviderError::unknown_model("nope").is_retryable());
        assert!(!ProviderError::refused("I cannot").is_retryable());
        assert!(!ProviderError::prompt_rejected("too long").is_retryable());
    }

    #[test]
    fn throttling_carries_its_wait_and_request_id() {
        let err = ProviderError::throttled(
            Duration::from_secs(7),
            ErrorContext::http(429, Some("req-1".into())),
        );
        assert_eq!(err.code(), "throttled");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(err.request_id(), Some("req-1"));

        let other = ProviderError::platform_with_context(
            "upstream",
            true,
            ErrorContext::http(502, None),
        );
        assert_eq!(other.retry_after(), None);
        assert_eq!(other.request_id(), None);
    }
}
