//! Bounded execution of a single task.
//!
//! One task = at most `max_retries + 1` calls, each under a hard per-call
//! timeout, followed by parse validation. The circuit breaker sees a single
//! verdict per task, not one per attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::gateway::{backoff_delay, AiClient, AiClientFactory};
use crate::prompts::{PromptTemplate, DEFAULT_PROMPT};

use super::breaker::CircuitBreakerRegistry;
use super::error::TaskError;
use super::hooks::{GeoParser, ParseContext};
use super::types::{ParsedData, RawOutcome, Task};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-call timeout for models without an entry in `model_timeouts`.
    pub default_call_timeout: Duration,
    pub model_timeouts: HashMap<String, Duration>,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound on a platform-requested wait between attempts.
    pub max_throttle_wait: Duration,
    pub prompt: PromptTemplate,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_call_timeout: Duration::from_secs(30),
            model_timeouts: HashMap::new(),
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            max_throttle_wait: Duration::from_secs(30),
            prompt: DEFAULT_PROMPT,
        }
    }
}

impl RunnerConfig {
    pub fn call_timeout(&self, model: &str) -> Duration {
        self.model_timeouts
            .get(model)
            .copied()
            .unwrap_or(self.default_call_timeout)
    }
}

/// Turns a task into exactly one outcome.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> RawOutcome;
}

pub struct BoundedTaskRunner {
    breakers: Arc<CircuitBreakerRegistry>,
    factory: Arc<dyn AiClientFactory>,
    parser: Arc<dyn GeoParser>,
    config: RunnerConfig,
}

impl BoundedTaskRunner {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        factory: Arc<dyn AiClientFactory>,
        parser: Arc<dyn GeoParser>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            breakers,
            factory,
            parser,
            config,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    async fn attempt(
        &self,
        client: &dyn AiClient,
        task: &Task,
        prompt: &str,
        call_timeout: Duration,
    ) -> Result<(String, ParsedData), TaskError> {
        let response = match timeout(call_timeout, client.generate_response(prompt)).await {
            Ok(result) => result?,
            Err(_) => return Err(TaskError::Timeout(call_timeout)),
        };

        let ctx = ParseContext {
            brand: &task.brand,
            competitors: &task.competitors,
        };
        let parsed = self
            .parser
            .parse(&response.text, &ctx)
            .map_err(|e| TaskError::Parse(e.to_string()))?;
        Ok((response.text, parsed))
    }
}

#[async_trait::async_trait]
impl TaskRunner for BoundedTaskRunner {
    async fn run(&self, task: &Task) -> RawOutcome {
        if !self.breakers.is_available(&task.model) {
            debug!(model = %task.model, brand = %task.brand, "circuit open, skipping task");
            return RawOutcome::skipped(task);
        }

        let client = match self.factory.create(&task.model) {
            Ok(client) => client,
            Err(err) => {
                let err = TaskError::from(err);
                warn!(model = %task.model, error = %err, "no client for model");
                self.breakers.record_failure(&task.model);
                return RawOutcome::failure(task, err.to_string(), 0);
            }
        };

        let prompt = self.config.prompt.render_task(task).to_prompt();
        let call_timeout = self.config.call_timeout(&task.model);
        let mut last_error: Option<TaskError> = None;
        let mut attempts = 0;

        for attempt in 0..=self.config.max_retries {
            attempts = attempt + 1;
            match self
                .attempt(client.as_ref(), task, &prompt, call_timeout)
                .await
            {
                Ok((text, parsed)) => {
                    self.breakers.record_success(&task.model);
                    return RawOutcome::success(task, text, parsed, attempts);
                }
                Err(err) => {
                    debug!(
                        model = %task.model,
                        brand = %task.brand,
                        attempt,
                        code = err.code(),
                        error = %err,
                        "attempt failed"
                    );
                    let retry = err.is_retryable() && attempt < self.config.max_retries;
                    let requested = err
                        .retry_after()
                        .map_or(Duration::ZERO, |d| d.min(self.config.max_throttle_wait));
                    last_error = Some(err);
                    if !retry {
                        break;
                    }
                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    sleep(delay.max(requested)).await;
                }
            }
        }

        self.breakers.record_failure(&task.model);
        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        warn!(
            model = %task.model,
            brand = %task.brand,
            attempts,
            error = %message,
            "task failed"
        );
        RawOutcome::failure(task, message, attempts)
    }
}
