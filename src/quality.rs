//! Default quality scoring of an execution's outcome set.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::engine::hooks::{QualityScore, QualityScorer};
use crate::engine::RawOutcome;
use crate::parse::{FIELD_SOURCE, SOURCE_JSON};

const COMPLETION_WEIGHT: f64 = 0.5;
const SUCCESS_WEIGHT: f64 = 0.3;
const STRUCTURED_WEIGHT: f64 = 0.2;

/// Weighted blend of completion rate, success rate and the share of answers
/// that carried a structured footer. Scores are on 0..=100.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletenessScorer;

pub fn quality_level(score: f64) -> &'static str {
    if score >= 80.0 {
        "high"
    } else if score >= 50.0 {
        "medium"
    } else {
        "low"
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

impl QualityScorer for CompletenessScorer {
    fn calculate(&self, outcomes: &[RawOutcome], completion_rate_percent: f64) -> QualityScore {
        let completion = if completion_rate_percent.is_finite() {
            completion_rate_percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let successes: Vec<&RawOutcome> = outcomes.iter().filter(|o| o.success).collect();
        let structured = successes
            .iter()
            .filter(|o| {
                o.parsed_data
                    .as_ref()
                    .and_then(|d| d.get(FIELD_SOURCE))
                    .and_then(Value::as_str)
                    == Some(SOURCE_JSON)
            })
            .count();

        let success_rate = percent(successes.len(), outcomes.len());
        let structured_rate = percent(structured, successes.len());
        let raw = COMPLETION_WEIGHT * completion
            + SUCCESS_WEIGHT * success_rate
            + STRUCTURED_WEIGHT * structured_rate;
        let score = (raw * 10.0).round() / 10.0;

        let mut details = BTreeMap::new();
        details.insert("completion_rate".to_string(), Value::from(completion));
        details.insert("success_rate".to_string(), Value::from(success_rate));
        details.insert("structured_rate".to_string(), Value::from(structured_rate));
        details.insert("outcome_count".to_string(), Value::from(outcomes.len()));

        QualityScore {
            score,
            level: quality_level(score).to_string(),
            details,
        }
    }
}
