//! Collaborator seams for the execution engine.
//!
//! The engine stays storage- and parser-agnostic. Callers inject:
//! - A parser that turns an answer into structured fields
//! - A persistence sink for per-brand records
//! - A quality scorer for the final outcome set

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{ExecutionStatus, ParsedData, RawOutcome};

// =============================================================================
// Parsing
// =============================================================================

/// What the parser knows about the task that produced the answer.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub brand: &'a str,
    pub competitors: &'a [String],
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,
    #[error("malformed json: {0}")]
    MalformedJson(String),
    #[error("{0}")]
    Message(String),
}

/// Extracts mention, rank and sentiment fields from a raw answer.
///
/// Never panics by contract; failures come back as `ParseError` and count as
/// a failed attempt.
pub trait GeoParser: Send + Sync {
    fn parse(&self, text: &str, ctx: &ParseContext<'_>) -> Result<ParsedData, ParseError>;
}

// =============================================================================
// Persistence
// =============================================================================

/// Context stored next to a brand's outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub user_id: Option<String>,
    pub user_level: Option<String>,
    pub models: Vec<String>,
    pub total_tasks: usize,
    pub status: Option<ExecutionStatus>,
    pub quality_score: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

#[async_trait::async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save_record(
        &self,
        execution_id: &str,
        brand: &str,
        outcomes: &[RawOutcome],
        metadata: &RecordMetadata,
    ) -> Result<(), SinkError>;
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecordSink;

#[async_trait::async_trait]
impl PersistenceSink for NoopRecordSink {
    async fn save_record(
        &self,
        _execution_id: &str,
        _brand: &str,
        _outcomes: &[RawOutcome],
        _metadata: &RecordMetadata,
    ) -> Result<(), SinkError> {
        Ok(())
    }
}

// =============================================================================
// Quality
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub score: f64,
    pub level: String,
    pub details: BTreeMap<String, serde_json::Value>,
}

pub trait QualityScorer: Send + Sync {
    fn calculate(&self, outcomes: &[RawOutcome], completion_rate_percent: f64) -> QualityScore;
}
