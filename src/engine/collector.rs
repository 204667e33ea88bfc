//! Batch execution with a guaranteed report.
//!
//! Two nets sit around the batch: each task future is unwound into a failure
//! outcome if it panics, and the batch loop itself is unwound into a warning.
//! Report construction runs last on every path and degrades to an
//! empty-but-valid report instead of propagating.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::quality::CompletenessScorer;

use super::aggregate;
use super::error::ReportError;
use super::hooks::{NoopRecordSink, PersistenceSink, QualityScorer, RecordMetadata};
use super::runner::TaskRunner;
use super::scheduler::Scheduler;
use super::trace::{OutcomeTrace, TraceSink};
use super::types::{ExecutionStatus, FinalReport, RawOutcome, Task};

/// What the collector needs to know about the execution it is running.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub execution_id: String,
    pub main_brand: String,
    pub brands: Vec<String>,
    pub total: usize,
    pub metadata: RecordMetadata,
}

pub struct FaultTolerantCollector {
    runner: Arc<dyn TaskRunner>,
    scheduler: Scheduler,
    sink: Arc<dyn PersistenceSink>,
    scorer: Arc<dyn QualityScorer>,
    trace: Option<Arc<dyn TraceSink>>,
    concurrency: usize,
}

/// Outcomes recorded so far plus the tasks pulled but not yet finished.
#[derive(Default)]
struct BatchLog {
    outcomes: Mutex<Vec<RawOutcome>>,
    in_flight: Mutex<HashMap<usize, Task>>,
}

impl BatchLog {
    fn pulled(&self, index: usize, task: &Task) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, task.clone());
    }

    /// Append an outcome and return its sequence number.
    fn push(&self, index: Option<usize>, outcome: RawOutcome) -> usize {
        if let Some(index) = index {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&index);
        }
        let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        outcomes.push(outcome);
        outcomes.len() - 1
    }

    fn take_in_flight(&self) -> Vec<Task> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pending: Vec<(usize, Task)> = in_flight.drain().collect();
        pending.sort_by_key(|(index, _)| *index);
        pending.into_iter().map(|(_, task)| task).collect()
    }

    fn into_outcomes(self) -> Vec<RawOutcome> {
        self.outcomes
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl FaultTolerantCollector {
    pub fn new(runner: Arc<dyn TaskRunner>, scheduler: Scheduler) -> Self {
        Self {
            runner,
            scheduler,
            sink: Arc::new(NoopRecordSink),
            scorer: Arc::new(CompletenessScorer),
            trace: None,
            concurrency: 1,
        }
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

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run every task and produce the execution's report.
    ///
    /// Every task pulled from `tasks` ends up with exactly one outcome. The
    /// loop stops early when the scheduler turns terminal (deadline or
    /// caller cancellation); in-flight calls are dropped and their tasks get
    /// an `abandoned` outcome.
    pub async fn run_batch<I>(&self, tasks: I, plan: &BatchPlan) -> FinalReport
    where
        I: Iterator<Item = Task> + Send,
    {
        let log = BatchLog::default();
        let mut warnings: Vec<String> = Vec::new();

        let batch = AssertUnwindSafe(self.collect(tasks, plan, &log))
            .catch_unwind()
            .await;
        let abandon_reason = match batch {
            Ok(()) => self.scheduler.snapshot().error_message,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(execution_id = %plan.execution_id, panic = %message, "batch aborted");
                warnings.push(format!("batch aborted: {message}"));
                Some("batch aborted".to_string())
            }
        };

        let abandoned = log.take_in_flight();
        if !abandoned.is_empty() {
            let reason = abandon_reason.unwrap_or_else(|| "interrupted".to_string());
            warn!(
                execution_id = %plan.execution_id,
                count = abandoned.len(),
                reason = %reason,
                "abandoning in-flight tasks"
            );
            for task in &abandoned {
                let outcome = RawOutcome::failure(task, format!("abandoned: {reason}"), 0);
                self.record(plan, &log, None, outcome);
            }
        }

        self.finish(plan, log.into_outcomes(), warnings).await
    }

    async fn collect<I>(&self, tasks: I, plan: &BatchPlan, log: &BatchLog)
    where
        I: Iterator<Item = Task> + Send,
    {
        let mut terminal = self.scheduler.subscribe();
        if self.scheduler.is_terminal() {
            return;
        }

        let runner = &self.runner;
        let mut outcomes = stream::iter(tasks.enumerate())
            .map(|(index, task)| {
                log.pulled(index, &task);
                async move {
                    let outcome = match AssertUnwindSafe(runner.run(&task)).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            warn!(
                                model = %task.model,
                                brand = %task.brand,
                                panic = %message,
                                "task panicked"
                            );
                            RawOutcome::failure(&task, format!("task panicked: {message}"), 0)
                        }
                    };
                    (index, outcome)
                }
            })
            .buffer_unordered(self.concurrency);

        loop {
            tokio::select! {
                biased;
                changed = terminal.changed() => {
                    if changed.is_err() || self.scheduler.is_terminal() {
                        debug!(execution_id = %plan.execution_id, "execution turned terminal, stopping batch");
                        break;
                    }
                }
                next = outcomes.next() => match next {
                    Some((index, outcome)) => self.record(plan, log, Some(index), outcome),
                    None => break,
                },
            }
        }
    }

    fn record(&self, plan: &BatchPlan, log: &BatchLog, index: Option<usize>, outcome: RawOutcome) {
        let stage = format!("{}/{}", outcome.brand, outcome.model);
        let event = self
            .trace
            .as_ref()
            .map(|_| OutcomeTrace::from_outcome(&plan.execution_id, 0, &outcome));
        let sequence = log.push(index, outcome);
        self.scheduler.advance(stage);

        if let (Some(trace), Some(mut event)) = (&self.trace, event) {
            event.sequence = sequence;
            if let Err(err) = trace.record(event) {
                warn!(execution_id = %plan.execution_id, error = %err, "trace record failed");
            }
        }
    }

    async fn finish(
        &self,
        plan: &BatchPlan,
        outcomes: Vec<RawOutcome>,
        mut warnings: Vec<String>,
    ) -> FinalReport {
        self.scheduler.set_stage("aggregating");

        let normalized: Vec<RawOutcome> = outcomes.iter().map(aggregate::normalize).collect();
        let outcomes = aggregate::dedupe(&normalized);
        let check = aggregate::verify_completeness(&outcomes, plan.total);
        if check.ok {
            self.scheduler.complete();
        } else {
            self.scheduler.partial(check.missing);
        }
        let state = self.scheduler.snapshot();
        if let Some(reason) = &state.error_message {
            warnings.push(format!("execution {}: {reason}", state.status));
        }
        if check.missing > 0 {
            warnings.push(format!("{} of {} tasks have no outcome", check.missing, plan.total));
        }

        let built = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.build_report(plan, &outcomes, state.status, check.missing, &warnings)
        }));
        let mut report = match built {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                warn!(execution_id = %plan.execution_id, error = %err, "report degraded");
                warnings.push(format!("report degraded: {err}"));
                FinalReport::degraded(&plan.execution_id, state.status, plan.total, warnings.clone())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(execution_id = %plan.execution_id, panic = %message, "report degraded");
                warnings.push(format!("report degraded: {message}"));
                FinalReport::degraded(&plan.execution_id, state.status, plan.total, warnings.clone())
            }
        };

        let sink_warnings = self.persist(plan, &report).await;
        report.warnings.extend(sink_warnings);

        info!(
            execution_id = %plan.execution_id,
            status = %report.status,
            outcomes = report.outcomes.len(),
            successes = report.success_count(),
            missing = report.missing_count,
            quality = report.quality_score,
            "report built"
        );
        report
    }

    fn build_report(
        &self,
        plan: &BatchPlan,
        outcomes: &[RawOutcome],
        status: ExecutionStatus,
        missing: usize,
        warnings: &[String],
    ) -> Result<FinalReport, ReportError> {
        let completion_rate = if plan.total == 0 {
            0.0
        } else {
            (plan.total - missing) as f64 * 100.0 / plan.total as f64
        };
        let quality = self.scorer.calculate(outcomes, completion_rate);
        if !quality.score.is_finite() {
            return Err(ReportError::Aggregation(format!(
                "quality score is not finite: {}",
                quality.score
            )));
        }

        let brand_summaries = aggregate::summarize(outcomes, &plan.brands);
        if let Some(bad) = brand_summaries
            .iter()
            .find(|s| !s.avg_rank.is_finite() || !s.avg_sentiment.is_finite())
        {
            return Err(ReportError::Aggregation(format!(
                "non-finite summary for brand {}",
                bad.brand
            )));
        }
        let insights = aggregate::insights(outcomes, &brand_summaries, &plan.main_brand);

        Ok(FinalReport {
            execution_id: plan.execution_id.clone(),
            status,
            created_at: Utc::now().to_rfc3339(),
            total_tasks: plan.total,
            outcomes: outcomes.to_vec(),
            missing_count: missing,
            brand_summaries,
            quality_score: quality.score,
            quality_level: quality.level,
            warnings: warnings.to_vec(),
            insights,
        })
    }

    /// Best-effort per-brand persistence. Returns warnings for failed brands.
    async fn persist(&self, plan: &BatchPlan, report: &FinalReport) -> Vec<String> {
        let metadata = RecordMetadata {
            status: Some(report.status),
            quality_score: report.quality_score,
            ..plan.metadata.clone()
        };

        let mut warnings = Vec::new();
        for brand in &plan.brands {
            let outcomes: Vec<RawOutcome> = report
                .outcomes
                .iter()
                .filter(|o| &o.brand == brand)
                .cloned()
                .collect();
            let saved = AssertUnwindSafe(self.sink.save_record(
                &plan.execution_id,
                brand,
                &outcomes,
                &metadata,
            ))
            .catch_unwind()
            .await;
            let failure = match saved {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(error) = failure {
                warn!(
                    execution_id = %plan.execution_id,
                    brand = %brand,
                    error = %error,
                    "persistence failed"
                );
                warnings.push(format!("persistence failed for {brand}: {error}"));
            }
        }
        warnings
    }
}
