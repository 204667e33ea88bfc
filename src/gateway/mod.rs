//! AI client gateway.
//!
//! The engine only ever sees [`AiClient`] and [`AiClientFactory`]; concrete
//! platforms (OpenRouter, or in-memory fakes in tests) plug in behind them.

pub mod error;
pub mod openrouter;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use error::{ErrorContext, ProviderError};
pub use openrouter::{CompletionSettings, OpenRouterAdapter, OpenRouterClient, OpenRouterClientFactory};
pub use types::*;

/// One AI chat platform/model.
///
/// Implementations must not retry internally; retries and timeouts belong to
/// the task runner so the circuit breaker sees one verdict per task.
#[async_trait::async_trait]
pub trait AiClient: Send + Sync {
    async fn generate_response(&self, prompt: &str) -> Result<RawResponse, ProviderError>;
}

/// Resolves model names to clients.
pub trait AiClientFactory: Send + Sync {
    /// Fails with [`ProviderError::UnknownModel`] if `model` is not registered.
    fn create(&self, model: &str) -> Result<Arc<dyn AiClient>, ProviderError>;
}

/// Factory over a fixed set of pre-built clients.
#[derive(Default, Clone)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<dyn AiClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, model: impl Into<String>, client: Arc<dyn AiClient>) -> Self {
        self.clients.insert(model.into(), client);
        self
    }

    pub fn contains(&self, model: &str) -> bool {
        self.clients.contains_key(model)
    }
}

impl AiClientFactory for ClientRegistry {
    fn create(&self, model: &str) -> Result<Arc<dyn AiClient>, ProviderError> {
        self.clients
            .get(model)
            .cloned()
            .ok_or_else(|| ProviderError::unknown_model(model))
    }
}

/// Exponential backoff between attempts: `base * 2^attempt`, exponent capped
/// at 5. Saturates at `Duration::MAX`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base.checked_mul(multiplier).unwrap_or(Duration::MAX)
}
