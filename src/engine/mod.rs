//! NxM brand perception execution engine.
//!
//! Turns a request (brands × questions × models) into a bounded,
//! fault-tolerant batch of AI calls and always produces a report:
//! - Per-task retries under a per-call timeout
//! - Per-model circuit breakers shared across tasks and executions
//! - Monotonic progress snapshots for pollers, with an overall deadline
//! - Outcome-level and batch-level panic nets around the batch

pub mod aggregate;
pub mod breaker;
pub mod collector;
pub mod error;
pub mod execute;
pub mod hooks;
pub mod matrix;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod trace;
pub mod types;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreakerRegistry, CircuitState};
pub use collector::{BatchPlan, FaultTolerantCollector};
pub use error::{EngineError, ReportError, TaskError};
pub use execute::{Engine, EngineConfig, ExecutionHandle, CANCELLED_MESSAGE};
pub use hooks::{
    GeoParser, NoopRecordSink, ParseContext, ParseError, PersistenceSink, QualityScore,
    QualityScorer, RecordMetadata, SinkError,
};
pub use matrix::TaskMatrix;
pub use runner::{BoundedTaskRunner, RunnerConfig, TaskRunner};
pub use scheduler::{Scheduler, EXECUTION_TIMEOUT_MESSAGE};
pub use store::{ExecutionStore, StoredExecution};
pub use trace::{JsonlTraceSink, OutcomeTrace, TraceError, TraceSink, TraceWorker};
pub use types::*;
