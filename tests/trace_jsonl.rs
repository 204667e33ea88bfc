use std::sync::Arc;

use async_trait::async_trait;
use brand_harness::engine::{OutcomeTrace, Task};
use brand_harness::gateway::{ProviderError, RawResponse};
use brand_harness::{
    AiClient, ClientRegistry, Engine, EngineConfig, JsonlTraceSink, RawOutcome, TraceSink,
};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    execution_id: String,
    sequence: usize,
    model: String,
    success: bool,
    skipped: bool,
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    let task = Task::new("Acme", "best crm?", "gpt");
    sink.record(OutcomeTrace::from_outcome(
        "exec",
        0,
        &RawOutcome::failure(&task, "timeout", 3),
    ))
    .unwrap();
    sink.record(OutcomeTrace::from_outcome("exec", 1, &RawOutcome::skipped(&task)))
        .unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: TraceRow = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.sequence, 0);
    assert!(!first.success);
    let second: TraceRow = serde_json::from_str(lines[1]).unwrap();
    assert!(second.skipped);
}

struct Answer;

#[async_trait]
impl AiClient for Answer {
    async fn generate_response(&self, _prompt: &str) -> Result<RawResponse, ProviderError> {
        Ok(RawResponse::text("answer", "Acme, then Globex."))
    }
}

#[tokio::test]
async fn engine_traces_every_recorded_outcome() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();

    let registry = ClientRegistry::new().register("gpt", Arc::new(Answer));
    let engine = Engine::new(Arc::new(registry), EngineConfig::default())
        .with_trace(Arc::new(sink) as Arc<dyn TraceSink>);
    engine.breakers().trip("ghost");

    let request = serde_json::from_value(serde_json::json!({
        "execution_id": "exec-trace",
        "main_brand": "Acme",
        "competitor_brands": ["Globex"],
        "questions": ["best crm?"],
        "models": [{"name": "gpt"}, {"name": "ghost"}]
    }))
    .unwrap();
    let report = engine.run(request).await.unwrap();
    assert_eq!(report.outcomes.len(), 4);

    drop(engine);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.execution_id == "exec-trace"));
    let mut sequences: Vec<usize> = rows.iter().map(|r| r.sequence).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert_eq!(rows.iter().filter(|r| r.skipped).count(), 2);
    assert!(rows
        .iter()
        .filter(|r| r.model == "gpt")
        .all(|r| r.success));
}
