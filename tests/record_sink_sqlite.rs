use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brand_harness::engine::{ExecutionStatus, PersistenceSink, RecordMetadata, Task};
use brand_harness::gateway::{ProviderError, RawResponse};
use brand_harness::{AiClient, ClientRegistry, Engine, EngineConfig, RawOutcome, SqliteRecordSink};
use serde_json::json;
use tempfile::tempdir;

fn outcome(brand: &str, success: bool) -> RawOutcome {
    let task = Task::new(brand, "best crm?", "gpt");
    if success {
        let mut parsed = BTreeMap::new();
        parsed.insert("brand_mentioned".to_string(), json!(true));
        RawOutcome::success(&task, "answer".into(), parsed, 1)
    } else {
        RawOutcome::failure(&task, "timeout", 3)
    }
}

#[tokio::test]
async fn save_then_load_roundtrips_and_upserts() {
    let dir = tempdir().unwrap();
    let sink = SqliteRecordSink::new(dir.path().join("records.sqlite")).unwrap();

    let metadata = RecordMetadata {
        user_id: Some("u-1".into()),
        models: vec!["gpt".into()],
        total_tasks: 2,
        status: Some(ExecutionStatus::PartiallyCompleted),
        quality_score: 55.0,
        ..RecordMetadata::default()
    };
    sink.save_record("exec-1", "Globex", &[outcome("Globex", false)], &metadata)
        .await
        .unwrap();
    sink.save_record("exec-1", "Acme", &[outcome("Acme", false)], &metadata)
        .await
        .unwrap();
    sink.save_record(
        "exec-1",
        "Acme",
        &[outcome("Acme", true), outcome("Acme", false)],
        &metadata,
    )
    .await
    .unwrap();
    sink.save_record("exec-2", "Acme", &[], &RecordMetadata::default())
        .await
        .unwrap();

    let records = sink.load_execution("exec-1").await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].brand, "Acme");
    assert_eq!(records[0].outcomes.len(), 2);
    assert_eq!(records[0].success_count, 1);
    assert_eq!(records[0].metadata.user_id.as_deref(), Some("u-1"));
    assert_eq!(
        records[0].metadata.status,
        Some(ExecutionStatus::PartiallyCompleted)
    );
    assert_eq!(records[1].brand, "Globex");
    assert_eq!(records[1].success_count, 0);

    assert!(sink.load_execution("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn records_survive_reopening_the_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("records.sqlite");

    {
        let sink = SqliteRecordSink::new(&path).unwrap();
        sink.save_record("exec-1", "Acme", &[outcome("Acme", true)], &RecordMetadata::default())
            .await
            .unwrap();
    }

    let reopened = SqliteRecordSink::new(&path).unwrap();
    assert_eq!(reopened.path(), path.as_path());
    let records = reopened.load_execution("exec-1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].outcomes[0].success);
}

struct Answer;

#[async_trait]
impl AiClient for Answer {
    async fn generate_response(&self, _prompt: &str) -> Result<RawResponse, ProviderError> {
        Ok(RawResponse::text(
            "answer",
            "Acme first.\n{\"brand_mentioned\": true, \"rank\": 1, \"sentiment\": 0.2}",
        ))
    }
}

#[tokio::test]
async fn engine_persists_one_record_per_brand() {
    let dir = tempdir().unwrap();
    let sink = Arc::new(SqliteRecordSink::new(dir.path().join("records.sqlite")).unwrap());
    let registry = ClientRegistry::new().register("gpt", Arc::new(Answer));
    let mut config = EngineConfig::default();
    config.runner.retry_base_delay = Duration::from_millis(1);
    let engine = Engine::new(Arc::new(registry), config).with_sink(sink.clone());

    let request = serde_json::from_value(json!({
        "execution_id": "exec-db",
        "main_brand": "Acme",
        "competitor_brands": ["Globex"],
        "questions": ["best crm?", "cheapest crm?"],
        "models": [{"name": "gpt"}],
        "user_id": "u-9"
    }))
    .unwrap();
    let report = engine.run(request).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert!(report.warnings.is_empty());

    let records = sink.load_execution("exec-db").await.unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.outcomes.len(), 2);
        assert!(record.outcomes.iter().all(|o| o.brand == record.brand));
        assert_eq!(record.metadata.user_id.as_deref(), Some("u-9"));
        assert_eq!(record.metadata.total_tasks, 4);
        assert_eq!(record.metadata.status, Some(ExecutionStatus::Completed));
    }
}
