//! Default answer parser.
//!
//! Prefers the JSON footer the prompt asks for; answers without one are read
//! with text heuristics (mention, numbered-list position, keyword sentiment).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::engine::aggregate::{FIELD_BRAND_MENTIONED, FIELD_RANK, FIELD_SENTIMENT};
use crate::engine::hooks::{GeoParser, ParseContext, ParseError};
use crate::engine::ParsedData;

pub const FIELD_SOURCE: &str = "source";
pub const FIELD_COMPETITORS_MENTIONED: &str = "competitors_mentioned";
pub const SOURCE_JSON: &str = "json";
pub const SOURCE_HEURISTIC: &str = "heuristic";

// Lazy-initialized regex patterns
static NUMBERED_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*]\s*)?(?:\*\*)?(\d{1,3})[.)]\s+(.+)$")
        .expect("Invalid numbered item regex")
});
static SENTENCE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?\n]+").expect("Invalid sentence split regex"));

const POSITIVE_WORDS: &[&str] = &[
    "best",
    "excellent",
    "great",
    "recommend",
    "reliable",
    "leading",
    "popular",
    "trusted",
    "strong",
    "outstanding",
];
const NEGATIVE_WORDS: &[&str] = &[
    "worst",
    "poor",
    "avoid",
    "unreliable",
    "expensive",
    "weak",
    "complaints",
    "issues",
    "lacking",
    "outdated",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct GeoResponseParser;

impl GeoParser for GeoResponseParser {
    fn parse(&self, text: &str, ctx: &ParseContext<'_>) -> Result<ParsedData, ParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut data = match last_json_object(trimmed) {
            Some(raw) => match parse_footer(raw)? {
                Some(footer) => footer,
                None => heuristics(trimmed, ctx.brand),
            },
            None => heuristics(trimmed, ctx.brand),
        };

        let mentioned: Vec<Value> = ctx
            .competitors
            .iter()
            .filter(|c| mentions(trimmed, c))
            .map(|c| Value::from(c.as_str()))
            .collect();
        data.insert(
            FIELD_COMPETITORS_MENTIONED.to_string(),
            Value::Array(mentioned),
        );
        Ok(data)
    }
}

/// Parse a JSON object. `Ok(None)` if it is valid but carries none of the
/// footer fields (e.g. a code sample inside the answer).
fn parse_footer(raw: &str) -> Result<Option<ParsedData>, ParseError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ParseError::MalformedJson(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ParseError::MalformedJson("expected a JSON object".to_string()));
    };
    let is_footer = [FIELD_BRAND_MENTIONED, FIELD_RANK, FIELD_SENTIMENT]
        .iter()
        .any(|key| map.contains_key(*key));
    if !is_footer {
        return Ok(None);
    }
    let mut data: ParsedData = map.into_iter().collect();
    data.insert(FIELD_SOURCE.to_string(), Value::from(SOURCE_JSON));
    Ok(Some(data))
}

/// The last top-level `{...}` span in `text`, with braces inside strings ignored.
fn last_json_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut last = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        last = Some(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    last
}

fn mentions(text: &str, brand: &str) -> bool {
    let brand = brand.trim();
    !brand.is_empty() && text.to_lowercase().contains(&brand.to_lowercase())
}

fn heuristics(text: &str, brand: &str) -> ParsedData {
    let mentioned = mentions(text, brand);
    let rank = if mentioned { list_position(text, brand) } else { None };
    let sentiment = if mentioned {
        keyword_sentiment(text, brand)
    } else {
        0.0
    };

    let mut data = ParsedData::new();
    data.insert(FIELD_BRAND_MENTIONED.to_string(), Value::Bool(mentioned));
    data.insert(FIELD_RANK.to_string(), Value::from(rank.unwrap_or(-1)));
    data.insert(FIELD_SENTIMENT.to_string(), Value::from(sentiment));
    data.insert(FIELD_SOURCE.to_string(), Value::from(SOURCE_HEURISTIC));
    data
}

/// Number of the first numbered-list item naming `brand`.
fn list_position(text: &str, brand: &str) -> Option<i64> {
    let needle = brand.trim().to_lowercase();
    NUMBERED_ITEM.captures_iter(text).find_map(|caps| {
        let item = caps.get(2)?.as_str().to_lowercase();
        if item.contains(&needle) {
            caps.get(1)?.as_str().parse::<i64>().ok()
        } else {
            None
        }
    })
}

/// Keyword balance over the sentences that name `brand`, in [-1, 1].
fn keyword_sentiment(text: &str, brand: &str) -> f64 {
    let needle = brand.trim().to_lowercase();
    let mut positive = 0usize;
    let mut negative = 0usize;
    for sentence in SENTENCE_SPLIT.split(text) {
        let sentence = sentence.to_lowercase();
        if !sentence.contains(&needle) {
            continue;
        }
        for word in sentence.split(|c: char| !c.is_alphanumeric()) {
            if POSITIVE_WORDS.contains(&word) {
                positive += 1;
            } else if NEGATIVE_WORDS.contains(&word) {
                negative += 1;
            }
        }
    }
    let total = positive + negative;
    if total == 0 {
        0.0
    } else {
        (positive as f64 - negative as f64) / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> Result<ParsedData, ParseError> {
        let competitors = vec!["Globex".to_string(), "Initech".to_string()];
        GeoResponseParser.parse(
            text,
            &ParseContext {
                brand: "Acme",
                competitors: &competitors,
            },
        )
    }

    #[test]
    fn footer_json_wins() {
        let text = r#"I'd go with Globex first, then Acme.
Example config: {"theme": "dark"}
{"brand_mentioned": true, "rank": 2, "sentiment": 0.4}"#;
        let data = parse(text).unwrap();
        assert_eq!(data["rank"], json!(2));
        assert_eq!(data["sentiment"], json!(0.4));
        assert_eq!(data["source"], json!("json"));
        assert_eq!(data["competitors_mentioned"], json!(["Globex"]));
    }

    #[test]
    fn non_footer_json_falls_back_to_heuristics() {
        let text = "Use Acme.\n{\"theme\": \"dark\"}";
        let data = parse(text).unwrap();
        assert_eq!(data["source"], json!("heuristic"));
        assert_eq!(data["brand_mentioned"], json!(true));
    }

    #[test]
    fn heuristics_read_numbered_lists_and_keywords() {
        let text = "Top picks:\n1. Globex - popular choice\n2. **Acme** - excellent and reliable support\n3. Initech";
        let data = parse(text).unwrap();
        assert_eq!(data["brand_mentioned"], json!(true));
        assert_eq!(data["rank"], json!(2));
        assert_eq!(data["sentiment"], json!(1.0));
        assert_eq!(data["competitors_mentioned"], json!(["Globex", "Initech"]));
    }

    #[test]
    fn absent_brand_has_default_fields() {
        let data = parse("Globex is the best. Avoid Initech.").unwrap();
        assert_eq!(data["brand_mentioned"], json!(false));
        assert_eq!(data["rank"], json!(-1));
        assert_eq!(data["sentiment"], json!(0.0));
    }

    #[test]
    fn negative_keywords_pull_sentiment_down() {
        let data = parse("Acme has had many complaints and issues. Acme is popular though.")
            .unwrap();
        let sentiment = data["sentiment"].as_f64().unwrap();
        assert!(sentiment < 0.0);
    }

    #[test]
    fn empty_and_malformed_answers_are_errors() {
        assert!(matches!(parse("   "), Err(ParseError::Empty)));
        assert!(matches!(
            parse(r#"Answer. {"brand_mentioned": tru, "rank": 1}"#),
            Err(ParseError::MalformedJson(_))
        ));
    }

    #[test]
    fn json_extraction_ignores_braces_in_strings() {
        let text = r#"prefix {"a": "}"} middle {"rank": 1, "note": "{x}"} tail"#;
        assert_eq!(
            last_json_object(text),
            Some(r#"{"rank": 1, "note": "{x}"}"#)
        );
        assert_eq!(last_json_object("no json here"), None);
    }
}
