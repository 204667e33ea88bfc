//! Outcome trace capture for executions.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::RawOutcome;

/// One line of the trace: a recorded outcome plus where it sits in the run.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeTrace {
    pub timestamp_ms: i64,
    pub execution_id: String,
    pub sequence: usize,
    pub brand: String,
    pub question_hash: String,
    pub model: String,
    pub success: bool,
    pub skipped: bool,
    pub attempts: u32,
    pub response_chars: usize,
    pub error: Option<String>,
}

impl OutcomeTrace {
    pub fn from_outcome(execution_id: &str, sequence: usize, outcome: &RawOutcome) -> Self {
        Self {
            timestamp_ms: now_epoch_ms(),
            execution_id: execution_id.to_string(),
            sequence,
            brand: outcome.brand.clone(),
            question_hash: blake3::hash(outcome.question.as_bytes())
                .to_hex()
                .to_string(),
            model: outcome.model.clone(),
            success: outcome.success,
            skipped: outcome.skipped,
            attempts: outcome.attempts,
            response_chars: outcome.response.as_ref().map_or(0, |r| r.chars().count()),
            error: outcome.error_message.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: OutcomeTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<OutcomeTrace>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    pub fn join(mut self) -> Result<(), TraceError> {
        let handle = self.handle.take();
        match handle {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<OutcomeTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: OutcomeTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<OutcomeTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
