//! Engine facade: validates requests, wires the components and runs each
//! execution on its own tokio task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::gateway::AiClientFactory;
use crate::parse::GeoResponseParser;
use crate::prompts::prompt_by_slug;
use crate::quality::CompletenessScorer;

use super::breaker::{BreakerConfig, CircuitBreakerRegistry};
use super::collector::{BatchPlan, FaultTolerantCollector};
use super::error::EngineError;
use super::hooks::{GeoParser, NoopRecordSink, PersistenceSink, QualityScorer, RecordMetadata};
use super::matrix::TaskMatrix;
use super::runner::{BoundedTaskRunner, RunnerConfig};
use super::scheduler::Scheduler;
use super::store::ExecutionStore;
use super::trace::TraceSink;
use super::types::{ExecutionRequest, ExecutionState, ExecutionStatus, FinalReport};

pub const CANCELLED_MESSAGE: &str = "cancelled by caller";

const ENV_PREFIX: &str = "BRAND_HARNESS_";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub breaker: BreakerConfig,
    pub runner: RunnerConfig,
    /// Tasks in flight per execution. 1 runs the matrix sequentially.
    pub concurrency: usize,
    /// Used when a request carries `timeout_seconds == 0`.
    pub default_execution_timeout: Duration,
    pub store_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            runner: RunnerConfig::default(),
            concurrency: 1,
            default_execution_timeout: Duration::from_secs(600),
            store_ttl: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `BRAND_HARNESS_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Same as [`EngineConfig::from_env`] with keys given without the prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let mut config = Self::default();

        if let Some(v) = parse_u64("BREAKER_THRESHOLD") {
            config.breaker.failure_threshold = v.clamp(1, u32::MAX as u64) as u32;
        }
        if let Some(v) = parse_u64("BREAKER_COOLDOWN_SECS") {
            config.breaker.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64("CALL_TIMEOUT_SECS").filter(|v| *v > 0) {
            config.runner.default_call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64("MAX_RETRIES") {
            config.runner.max_retries = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = parse_u64("RETRY_BASE_DELAY_MS") {
            config.runner.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_u64("MAX_THROTTLE_WAIT_SECS") {
            config.runner.max_throttle_wait = Duration::from_secs(v);
        }
        if let Some(template) = lookup("PROMPT").and_then(|slug| prompt_by_slug(slug.trim())) {
            config.runner.prompt = template;
        }
        if let Some(raw) = lookup("MODEL_TIMEOUTS") {
            config.runner.model_timeouts = parse_model_timeouts(&raw);
        }
        if let Some(v) = parse_u64("CONCURRENCY").filter(|v| *v > 0) {
            config.concurrency = v as usize;
        }
        if let Some(v) = parse_u64("EXECUTION_TIMEOUT_SECS").filter(|v| *v > 0) {
            config.default_execution_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64("STORE_TTL_SECS") {
            config.store_ttl = Duration::from_secs(v);
        }
        config
    }
}

/// `"model=secs,model=secs"`. Malformed entries are skipped.
fn parse_model_timeouts(raw: &str) -> HashMap<String, Duration> {
    raw.split(',')
        .filter_map(|entry| {
            let (model, secs) = entry.split_once('=')?;
            let model = model.trim();
            let secs: u64 = secs.trim().parse().ok()?;
            (!model.is_empty() && secs > 0).then(|| (model.to_string(), Duration::from_secs(secs)))
        })
        .collect()
}

/// A running execution.
pub struct ExecutionHandle {
    execution_id: String,
    total: usize,
    scheduler: Scheduler,
    store: Arc<ExecutionStore>,
    task: JoinHandle<FinalReport>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn snapshot(&self) -> ExecutionState {
        self.scheduler.snapshot()
    }

    /// Stop the execution. Outcomes already collected are kept and the
    /// report is still produced. Returns false if it had already finished.
    pub fn cancel(&self) -> bool {
        self.scheduler.fail(CANCELLED_MESSAGE)
    }

    /// Wait for the final report.
    pub async fn wait(self) -> FinalReport {
        match self.task.await {
            Ok(report) => report,
            Err(err) => {
                warn!(execution_id = %self.execution_id, error = %err, "execution task failed");
                self.scheduler.fail(format!("execution task failed: {err}"));
                let report = FinalReport::degraded(
                    &self.execution_id,
                    ExecutionStatus::Failed,
                    self.total,
                    vec![format!("execution task failed: {err}")],
                );
                self.store.attach_report(&self.execution_id, report.clone());
                report
            }
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    store: Arc<ExecutionStore>,
    factory: Arc<dyn AiClientFactory>,
    parser: Arc<dyn GeoParser>,
    sink: Arc<dyn PersistenceSink>,
    scorer: Arc<dyn QualityScorer>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl Engine {
    pub fn new(factory: Arc<dyn AiClientFactory>, config: EngineConfig) -> Self {
        Self {
            breakers: Arc::new(CircuitBreakerRegistry::new(config.breaker.clone())),
            store: Arc::new(ExecutionStore::new(config.store_ttl)),
            factory,
            parser: Arc::new(GeoResponseParser),
            sink: Arc::new(NoopRecordSink),
            scorer: Arc::new(CompletenessScorer),
            trace: None,
            config,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn GeoParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Breakers are shared by every execution of this engine.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    /// Validate a request and build its task matrix without running anything.
    pub fn plan(&self, request: &ExecutionRequest) -> Result<TaskMatrix, EngineError> {
        if request.main_brand.trim().is_empty() {
            return Err(EngineError::invalid_input("main_brand must not be empty"));
        }
        let mut questions: Vec<String> = Vec::new();
        for question in request.questions.iter().map(|q| q.trim()) {
            if !question.is_empty() && !questions.iter().any(|q| q == question) {
                questions.push(question.to_string());
            }
        }
        let models = request.enabled_models();
        if !request.models.is_empty() && models.is_empty() {
            return Err(EngineError::invalid_input("no enabled models"));
        }
        TaskMatrix::build(request.brands(), questions, models)
    }

    /// Start an execution and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: ExecutionRequest) -> Result<ExecutionHandle, EngineError> {
        let matrix = self.plan(&request)?;
        let execution_id = if request.execution_id.trim().is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            request.execution_id.trim().to_string()
        };
        if self.store.get(&execution_id).is_some() {
            return Err(EngineError::invalid_input(format!(
                "execution {execution_id} already exists"
            )));
        }
        let timeout = if request.timeout_seconds == 0 {
            self.config.default_execution_timeout
        } else {
            Duration::from_secs(request.timeout_seconds)
        };
        let total = matrix.total();

        let plan = BatchPlan {
            execution_id: execution_id.clone(),
            main_brand: matrix.brands()[0].clone(),
            brands: matrix.brands().to_vec(),
            total,
            metadata: RecordMetadata {
                user_id: request.user_id.clone(),
                user_level: request.user_level.clone(),
                models: matrix.models().to_vec(),
                total_tasks: total,
                ..RecordMetadata::default()
            },
        };

        let scheduler = Scheduler::new(&execution_id, Some(self.store.clone()));
        let runner = Arc::new(BoundedTaskRunner::new(
            self.breakers.clone(),
            self.factory.clone(),
            self.parser.clone(),
            self.config.runner.clone(),
        ));
        let mut collector = FaultTolerantCollector::new(runner, scheduler.clone())
            .with_sink(self.sink.clone())
            .with_scorer(self.scorer.clone())
            .with_concurrency(self.config.concurrency);
        if let Some(trace) = &self.trace {
            collector = collector.with_trace(trace.clone());
        }

        info!(
            execution_id = %execution_id,
            total,
            models = ?matrix.models(),
            timeout_secs = timeout.as_secs(),
            concurrency = self.config.concurrency,
            "execution submitted"
        );
        scheduler.initialize(total);
        scheduler.start_deadline(timeout);

        let store = self.store.clone();
        let task = tokio::spawn(async move {
            let report = collector.run_batch(matrix.tasks(), &plan).await;
            store.attach_report(&plan.execution_id, report.clone());
            report
        });

        Ok(ExecutionHandle {
            execution_id,
            total,
            scheduler,
            store: self.store.clone(),
            task,
        })
    }

    /// Submit and wait for the report.
    pub async fn run(&self, request: ExecutionRequest) -> Result<FinalReport, EngineError> {
        Ok(self.submit(request)?.wait().await)
    }

    pub fn snapshot(&self, execution_id: &str) -> Option<ExecutionState> {
        self.store.get(execution_id).map(|stored| stored.state)
    }

    pub fn report(&self, execution_id: &str) -> Option<Arc<FinalReport>> {
        self.store.get(execution_id).and_then(|stored| stored.report)
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}
