//! Turns the classification service's free-form answer into a
//! [`ClassificationResult`] keyed by filename.
//!
//! Nothing here fails: an answer that cannot be read becomes a rejected result
//! whose `reason` says why, so a batch keeps going.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::warn;

use crate::domain::{ClassificationResult, IncludedImage};
use crate::request::IdentifierTable;

pub const NO_STRUCTURED_BLOCK: &str = "no structured block found";
pub const NO_REASON: &str = "No reason provided";

/// Phrases that already mark a caption as describing a sequence.
pub const SEQUENCE_TERMS: &[&str] = &[
    "sequence of",
    "series of",
    "photo session",
    "consecutive shots",
    "multiple frames",
    "progression of",
];

const SUBJECT_WORDS: &[&str] = &["woman", "man", "person", "model", "influencer"];
const ARTICLES: &[&str] = &["a", "an", "the"];

/// The service's record before identifiers are translated.
#[derive(Debug, Clone, PartialEq)]
pub struct RawClassification {
    pub is_series: bool,
    pub included: Vec<RawIncluded>,
    pub excluded: Vec<String>,
    pub caption: String,
    pub reason: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIncluded {
    pub token: String,
    pub order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed(RawClassification),
    Unparsed(String),
}

/// Extracts the span between the first `{` and the last `}` and reads it as a
/// record, filling defaults for missing fields.
pub fn parse_response(raw: &str) -> ParseOutcome {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return ParseOutcome::Unparsed(NO_STRUCTURED_BLOCK.to_string());
    };
    if end < start {
        return ParseOutcome::Unparsed(NO_STRUCTURED_BLOCK.to_string());
    }

    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(map)) => ParseOutcome::Parsed(read_record(&map)),
        Ok(_) => ParseOutcome::Unparsed("parse error: expected a JSON object".to_string()),
        Err(err) => ParseOutcome::Unparsed(format!("parse error: {err}")),
    }
}

fn read_record(map: &Map<String, Value>) -> RawClassification {
    let is_series = match map.get("is_series") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text.trim().eq_ignore_ascii_case("true"),
        _ => false,
    };

    let included = map
        .get("images")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(read_included).collect())
        .unwrap_or_default();

    let excluded = map
        .get("excluded_images")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(read_token).collect())
        .unwrap_or_default();

    let caption = map
        .get("series_caption")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .unwrap_or_default();

    let reason = map
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| NO_REASON.to_string());

    let confidence = match map.get("confidence") {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };

    RawClassification {
        is_series,
        included,
        excluded,
        caption,
        reason,
        confidence: clamp_confidence(confidence),
    }
}

fn read_included(item: &Value) -> Option<RawIncluded> {
    match item {
        Value::String(token) => Some(RawIncluded {
            token: token.clone(),
            order: None,
        }),
        Value::Object(fields) => {
            let token = fields
                .get("path")
                .or_else(|| fields.get("id"))
                .and_then(Value::as_str)?
                .to_string();
            let order = match fields.get("order") {
                Some(Value::Number(number)) => number.as_u64(),
                Some(Value::String(text)) => text.trim().parse().ok(),
                _ => None,
            }
            .filter(|order| *order > 0)
            .and_then(|order| u32::try_from(order).ok());
            Some(RawIncluded { token, order })
        }
        _ => None,
    }
}

fn read_token(item: &Value) -> Option<String> {
    match item {
        Value::String(token) => Some(token.clone()),
        Value::Object(fields) => fields
            .get("path")
            .or_else(|| fields.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Prefixes a sequence qualifier unless the caption already carries one.
/// Applying it to its own output returns the input unchanged.
pub fn apply_caption_rule(caption: &str) -> String {
    let caption = caption.trim();
    if caption.is_empty() {
        return String::new();
    }
    let lower = caption.to_lowercase();
    if SEQUENCE_TERMS.iter().any(|term| lower.contains(term)) {
        return caption.to_string();
    }

    let leading = lower
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .find(|word| !ARTICLES.contains(word))
        .unwrap_or("");
    if SUBJECT_WORDS.contains(&leading) {
        format!("sequence of photos showing {caption}")
    } else {
        format!("photo session capturing {caption}")
    }
}

/// Full pipeline: parse, repair, apply the caption rule, translate identifiers
/// back to filenames and make the included order a strict `1..=N` sequence.
pub fn normalize_response(raw: &str, table: &IdentifierTable) -> ClassificationResult {
    match parse_response(raw) {
        ParseOutcome::Parsed(record) => finalize(record, table),
        ParseOutcome::Unparsed(reason) => {
            warn!("unusable classification response: {reason}");
            ClassificationResult::rejected(reason)
        }
    }
}

fn finalize(record: RawClassification, table: &IdentifierTable) -> ClassificationResult {
    let mut resolved = Vec::with_capacity(record.included.len());
    for (position, item) in record.included.iter().enumerate() {
        match table.resolve(&item.token) {
            Some(file_name) => {
                let order = item.order.unwrap_or(position as u32 + 1);
                resolved.push((file_name.to_string(), order, position));
            }
            None => warn!("dropping unknown identifier {} from included images", item.token),
        }
    }
    resolved.sort_by_key(|(_, order, position)| (*order, *position));

    let mut seen = HashSet::new();
    let included = resolved
        .into_iter()
        .filter(|(file_name, _, _)| seen.insert(file_name.clone()))
        .enumerate()
        .map(|(index, (path, _, _))| IncludedImage {
            path,
            order: index as u32 + 1,
        })
        .collect::<Vec<_>>();

    let mut excluded = Vec::with_capacity(record.excluded.len());
    for token in &record.excluded {
        match table.resolve(token) {
            Some(file_name) => {
                if seen.insert(file_name.to_string()) {
                    excluded.push(file_name.to_string());
                }
            }
            None => warn!("dropping unknown identifier {token} from excluded images"),
        }
    }

    let mut is_series = record.is_series;
    let mut reason = record.reason;
    if is_series && included.len() < 2 {
        warn!(
            "series answer kept {} usable image(s); treating as not a series",
            included.len()
        );
        is_series = false;
        reason = format!("{reason} (fewer than two usable images after normalization)");
    }

    let caption = if is_series && !record.caption.is_empty() {
        apply_caption_rule(&record.caption)
    } else {
        record.caption
    };

    ClassificationResult {
        is_series,
        included,
        excluded,
        caption,
        reason,
        confidence: record.confidence,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn missing_braces_is_unparsed() {
        assert_matches!(
            parse_response("I could not decide."),
            ParseOutcome::Unparsed(reason) if reason == NO_STRUCTURED_BLOCK
        );
        assert_matches!(parse_response("} backwards {"), ParseOutcome::Unparsed(_));
    }

    #[test]
    fn broken_json_reports_parse_error() {
        let outcome = parse_response("```json\n{\"is_series\": true,,}\n```");
        assert_matches!(outcome, ParseOutcome::Unparsed(reason) if reason.starts_with("parse error: "));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let ParseOutcome::Parsed(record) = parse_response("{\"is_series\": false}") else {
            panic!("expected a parsed record");
        };
        assert!(record.included.is_empty());
        assert!(record.excluded.is_empty());
        assert_eq!(record.caption, "");
        assert_eq!(record.reason, NO_REASON);
        assert_eq!(record.confidence, 0.0);
    }

    #[test]
    fn lenient_field_shapes() {
        let ParseOutcome::Parsed(record) = parse_response(
            r#"{"is_series": "TRUE", "images": ["_01", {"path": "_02", "order": "2"}], "confidence": "1.7"}"#,
        ) else {
            panic!("expected a parsed record");
        };
        assert!(record.is_series);
        assert_eq!(record.included[0].order, None);
        assert_eq!(record.included[1].order, Some(2));
        assert_eq!(record.confidence, 1.0);
    }

    #[test]
    fn caption_rule_prefixes_by_leading_word() {
        assert_eq!(
            apply_caption_rule("woman posing on a balcony"),
            "sequence of photos showing woman posing on a balcony"
        );
        assert_eq!(
            apply_caption_rule("A model walks through Vienna"),
            "sequence of photos showing A model walks through Vienna"
        );
        assert_eq!(
            apply_caption_rule("golden hour on the beach"),
            "photo session capturing golden hour on the beach"
        );
        assert_eq!(
            apply_caption_rule("Series of shots in a cafe"),
            "Series of shots in a cafe"
        );
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }
}
