//! Normalization, dedup, completeness and per-brand aggregation of outcomes.
//!
//! Everything here is pure and order-independent: the collector may record
//! outcomes in any order when running with concurrency above one.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value;

use super::types::{BrandSummary, CompletenessCheck, ParsedData, RawOutcome};

pub const FIELD_BRAND_MENTIONED: &str = "brand_mentioned";
pub const FIELD_RANK: &str = "rank";
pub const FIELD_SENTIMENT: &str = "sentiment";

const POSITIVE_THRESHOLD: f64 = 0.5;
const NEGATIVE_THRESHOLD: f64 = -0.5;

// =============================================================================
// Normalization
// =============================================================================

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            !matches!(s.as_str(), "" | "false" | "no" | "0" | "none" | "null")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

fn coerce_rank(value: Option<&Value>) -> i64 {
    value
        .and_then(as_f64)
        .map(|f| f.round() as i64)
        .unwrap_or(-1)
}

fn coerce_sentiment(value: Option<&Value>) -> f64 {
    value.and_then(as_f64).map_or(0.0, |f| f.clamp(-1.0, 1.0))
}

/// Coerce the loosely-typed parsed fields to their canonical types.
///
/// `brand_mentioned` becomes a bool, `rank` an integer (`-1` when absent) and
/// `sentiment` a float in [-1, 1] (`0.0` when absent). Other fields are kept.
/// Outcomes without parsed data are returned unchanged.
pub fn normalize(outcome: &RawOutcome) -> RawOutcome {
    let mut normalized = outcome.clone();
    if let Some(data) = normalized.parsed_data.as_mut() {
        normalize_fields(data);
    }
    normalized
}

fn normalize_fields(data: &mut ParsedData) {
    let mentioned = data.get(FIELD_BRAND_MENTIONED).is_some_and(truthy);
    let rank = coerce_rank(data.get(FIELD_RANK));
    let sentiment = coerce_sentiment(data.get(FIELD_SENTIMENT));

    data.insert(FIELD_BRAND_MENTIONED.to_string(), Value::Bool(mentioned));
    data.insert(FIELD_RANK.to_string(), Value::from(rank));
    data.insert(FIELD_SENTIMENT.to_string(), Value::from(sentiment));
}

fn parsed_rank(outcome: &RawOutcome) -> i64 {
    coerce_rank(outcome.parsed_data.as_ref().and_then(|d| d.get(FIELD_RANK)))
}

fn parsed_sentiment(outcome: &RawOutcome) -> f64 {
    coerce_sentiment(
        outcome
            .parsed_data
            .as_ref()
            .and_then(|d| d.get(FIELD_SENTIMENT)),
    )
}

// =============================================================================
// Dedup
// =============================================================================

/// Canonical content hash of an outcome. The timestamp is not part of it.
pub fn hash(outcome: &RawOutcome) -> String {
    let parsed = outcome
        .parsed_data
        .as_ref()
        .and_then(|d| serde_json::to_string(d).ok());

    let mut hasher = blake3::Hasher::new();
    let mut field = |value: Option<&str>| {
        // Length-prefixed so field boundaries are unambiguous; None != "".
        match value {
            Some(v) => {
                hasher.update(&[1]);
                hasher.update(&(v.len() as u64).to_le_bytes());
                hasher.update(v.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
    };
    field(Some(&outcome.brand));
    field(Some(&outcome.question));
    field(Some(&outcome.model));
    field(Some(if outcome.success { "1" } else { "0" }));
    field(Some(if outcome.skipped { "1" } else { "0" }));
    field(outcome.response.as_deref());
    field(parsed.as_deref());
    field(outcome.error_message.as_deref());
    hasher.finalize().to_hex().to_string()
}

/// Drop outcomes whose hash was already seen, keeping first occurrences in order.
pub fn dedupe(outcomes: &[RawOutcome]) -> Vec<RawOutcome> {
    let mut seen: HashSet<String> = HashSet::with_capacity(outcomes.len());
    outcomes
        .iter()
        .filter(|outcome| seen.insert(hash(outcome)))
        .cloned()
        .collect()
}

// =============================================================================
// Completeness & aggregation
// =============================================================================

/// Counts outcomes only; an all-failure set of the right size is complete.
pub fn verify_completeness(outcomes: &[RawOutcome], expected_total: usize) -> CompletenessCheck {
    CompletenessCheck {
        ok: outcomes.len() == expected_total,
        missing: expected_total.saturating_sub(outcomes.len()),
    }
}

/// Summary of every outcome for `brand`. Ranks and sentiments come from the
/// outcomes that carry parsed data.
pub fn aggregate_by_brand(outcomes: &[RawOutcome], brand: &str) -> BrandSummary {
    let mentions = outcomes.iter().filter(|o| o.brand == brand).count();
    let matching: Vec<&RawOutcome> = outcomes
        .iter()
        .filter(|o| o.brand == brand && o.parsed_data.is_some())
        .collect();

    let ranks: Vec<i64> = matching
        .iter()
        .map(|o| parsed_rank(o))
        .filter(|rank| *rank > 0)
        .collect();
    let avg_rank = if ranks.is_empty() {
        -1.0
    } else {
        ranks.iter().sum::<i64>() as f64 / ranks.len() as f64
    };

    let sentiments: Vec<f64> = matching.iter().map(|o| parsed_sentiment(o)).collect();
    let avg_sentiment = if sentiments.is_empty() {
        0.0
    } else {
        sentiments.iter().sum::<f64>() / sentiments.len() as f64
    };

    BrandSummary {
        brand: brand.to_string(),
        mention_count: mentions,
        avg_rank,
        avg_sentiment,
        positive_count: sentiments.iter().filter(|s| **s > POSITIVE_THRESHOLD).count(),
        negative_count: sentiments.iter().filter(|s| **s < NEGATIVE_THRESHOLD).count(),
    }
}

/// One summary per brand, in the given order.
pub fn summarize(outcomes: &[RawOutcome], brands: &[String]) -> Vec<BrandSummary> {
    brands
        .iter()
        .map(|brand| aggregate_by_brand(outcomes, brand))
        .collect()
}

// =============================================================================
// Insights
// =============================================================================

/// Headline figures for the report. `None` when nothing succeeded.
pub fn insights(
    outcomes: &[RawOutcome],
    summaries: &[BrandSummary],
    main_brand: &str,
) -> Option<BTreeMap<String, Value>> {
    let successes = outcomes.iter().filter(|o| o.success).count();
    if successes == 0 {
        return None;
    }

    let mut ranked: Vec<&BrandSummary> = summaries.iter().filter(|s| s.avg_rank > 0.0).collect();
    ranked.sort_by(|a, b| {
        a.avg_rank
            .total_cmp(&b.avg_rank)
            .then_with(|| a.brand.cmp(&b.brand))
    });

    let skipped_models: BTreeSet<&str> = outcomes
        .iter()
        .filter(|o| o.skipped)
        .map(|o| o.model.as_str())
        .collect();

    let main_position = ranked
        .iter()
        .position(|s| s.brand == main_brand)
        .map(|idx| idx + 1);
    let main_summary = summaries.iter().find(|s| s.brand == main_brand);

    let mut map = BTreeMap::new();
    map.insert(
        "success_rate".to_string(),
        Value::from(successes as f64 * 100.0 / outcomes.len() as f64),
    );
    map.insert(
        "leading_brand".to_string(),
        ranked
            .first()
            .map_or(Value::Null, |s| Value::from(s.brand.clone())),
    );
    map.insert(
        "main_brand".to_string(),
        serde_json::json!({
            "brand": main_brand,
            "position": main_position,
            "avg_rank": main_summary.map(|s| s.avg_rank),
            "avg_sentiment": main_summary.map(|s| s.avg_sentiment),
        }),
    );
    map.insert(
        "skipped_models".to_string(),
        Value::from(
            skipped_models
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>(),
        ),
    );
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Task;
    use serde_json::json;

    fn parsed(value: Value) -> ParsedData {
        serde_json::from_value(value).unwrap()
    }

    fn success(brand: &str, model: &str, data: Value) -> RawOutcome {
        RawOutcome::success(&Task::new(brand, "q", model), "answer".into(), parsed(data), 1)
    }

    #[test]
    fn normalize_coerces_loose_fields() {
        let outcome = success(
            "Acme",
            "m",
            json!({"brand_mentioned": "yes", "rank": "2", "sentiment": 3, "extra": 1}),
        );
        let data = normalize(&outcome).parsed_data.unwrap();
        assert_eq!(data["brand_mentioned"], json!(true));
        assert_eq!(data["rank"], json!(2));
        assert_eq!(data["sentiment"], json!(1.0));
        assert_eq!(data["extra"], json!(1));

        let empty = normalize(&success("Acme", "m", json!({"brand_mentioned": "false"})));
        let data = empty.parsed_data.unwrap();
        assert_eq!(data["brand_mentioned"], json!(false));
        assert_eq!(data["rank"], json!(-1));
        assert_eq!(data["sentiment"], json!(0.0));
    }

    #[test]
    fn normalize_leaves_failures_alone() {
        let failure = RawOutcome::failure(&Task::new("Acme", "q", "m"), "boom", 3);
        assert_eq!(normalize(&failure), failure);
    }

    #[test]
    fn hash_ignores_timestamp_but_not_content() {
        let a = success("Acme", "m", json!({"rank": 1}));
        let mut b = a.clone();
        b.timestamp_ms += 1_000;
        assert_eq!(hash(&a), hash(&b));

        let mut c = a.clone();
        c.model = "other".into();
        assert_ne!(hash(&a), hash(&c));

        let mut d = a.clone();
        d.response = None;
        let mut e = a.clone();
        e.response = Some(String::new());
        assert_ne!(hash(&d), hash(&e));
    }

    #[test]
    fn dedupe_is_idempotent_and_keeps_first_order() {
        let a = success("Acme", "m1", json!({"rank": 1}));
        let b = success("Acme", "m2", json!({"rank": 2}));
        let c = success("Globex", "m1", json!({"rank": 3}));
        let input = vec![a.clone(), b.clone(), a.clone(), c.clone(), b.clone()];

        let once = dedupe(&input);
        assert_eq!(once, vec![a, b, c]);
        assert_eq!(dedupe(&once), once);
    }

    #[test]
    fn completeness_counts_outcomes_regardless_of_content() {
        let task = Task::new("Acme", "q", "m");
        let failures = vec![
            RawOutcome::failure(&task, "x", 1),
            RawOutcome::skipped(&task),
        ];
        assert_eq!(
            verify_completeness(&failures, 2),
            CompletenessCheck { ok: true, missing: 0 }
        );
        assert_eq!(
            verify_completeness(&failures, 5),
            CompletenessCheck { ok: false, missing: 3 }
        );
    }

    #[test]
    fn empty_brand_summary_uses_defaults() {
        let summary = aggregate_by_brand(&[], "Acme");
        assert_eq!(summary.mention_count, 0);
        assert_eq!(summary.avg_rank, -1.0);
        assert_eq!(summary.avg_sentiment, 0.0);
    }

    #[test]
    fn brand_summary_counts_every_outcome_and_averages_parsed_ones() {
        let outcomes: Vec<RawOutcome> = vec![
            success("Acme", "m1", json!({"rank": 1, "sentiment": 0.9})),
            success("Acme", "m2", json!({"rank": 3, "sentiment": -0.8})),
            success("Acme", "m3", json!({"rank": -1, "sentiment": 0.2})),
            success("Globex", "m1", json!({"rank": 1, "sentiment": 1.0})),
            RawOutcome::failure(&Task::new("Acme", "q", "m4"), "boom", 3),
            RawOutcome::skipped(&Task::new("Acme", "q", "m5")),
        ]
        .iter()
        .map(normalize)
        .collect();

        let summary = aggregate_by_brand(&outcomes, "Acme");
        assert_eq!(summary.mention_count, 5);
        assert_eq!(summary.avg_rank, 2.0);
        assert!((summary.avg_sentiment - 0.1).abs() < 1e-9);
        assert_eq!(summary.positive_count, 1);
        assert_eq!(summary.negative_count, 1);
    }

    #[test]
    fn insights_pick_leading_brand_and_skipped_models() {
        let outcomes = vec![
            success("Acme", "m1", json!({"rank": 3})),
            success("Globex", "m1", json!({"rank": 1})),
            RawOutcome::skipped(&Task::new("Acme", "q", "flaky")),
        ];
        let brands = vec!["Acme".to_string(), "Globex".to_string()];
        let summaries = summarize(&outcomes, &brands);

        let map = insights(&outcomes, &summaries, "Acme").unwrap();
        assert_eq!(map["leading_brand"], json!("Globex"));
        assert_eq!(map["main_brand"]["position"], json!(2));
        assert_eq!(map["skipped_models"], json!(["flaky"]));

        let none = insights(&outcomes[2..], &summaries, "Acme");
        assert!(none.is_none());
    }
}
