#![forbid(unsafe_code)]

//! # brand-harness
//!
//! Brand perception testing across AI chat platforms.
//!
//! A request names a main brand, its competitors, a set of shopper questions
//! and the models to ask. Every (brand, question, model) combination becomes
//! one task; each answer is parsed for whether the brand was mentioned, where
//! it ranked and how it was described. The engine keeps going when individual
//! calls or whole models fail, and always hands back a report.

pub mod engine;
pub mod gateway;
pub mod parse;
pub mod prompts;
pub mod quality;
pub mod records;

pub use engine::{
    Engine, EngineConfig, EngineError, ExecutionHandle, ExecutionRequest, ExecutionState,
    ExecutionStatus, FinalReport, JsonlTraceSink, ModelSelection, RawOutcome, Task, TraceSink,
    TraceWorker,
};
pub use gateway::{AiClient, AiClientFactory, ClientRegistry, OpenRouterClientFactory};
pub use parse::GeoResponseParser;
pub use quality::CompletenessScorer;
pub use records::SqliteRecordSink;
