use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::normalizer::normalize_enhancement;
use crate::records::UpdateRequest;

static FENCED_OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```[A-Za-z0-9_-]*\s*(\{[\s\S]*?\})\s*```").expect("fenced block pattern compiles")
});

static BARE_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[\s\S]{20,}\}").expect("bare object pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    Fenced,
    BareObject,
}

impl ExtractionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionSource::Fenced => "fenced",
            ExtractionSource::BareObject => "bare_object",
        }
    }
}

/// Finds the candidate JSON text: a fenced block first, otherwise the widest
/// brace-delimited span with at least twenty characters inside.
pub fn locate_payload(text: &str) -> Option<(ExtractionSource, &str)> {
    if let Some(block) = FENCED_OBJECT.captures(text).and_then(|caps| caps.get(1)) {
        return Some((ExtractionSource::Fenced, block.as_str()));
    }
    BARE_OBJECT
        .find(text)
        .map(|found| (ExtractionSource::BareObject, found.as_str()))
}

/// Locates and parses the payload. Anything other than a JSON object is `None`.
pub fn parse_payload(text: &str) -> Option<(ExtractionSource, Value)> {
    let Some((source, candidate)) = locate_payload(text) else {
        debug!(len = text.len(), "no structured payload in completion");
        return None;
    };

    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => Some((source, value)),
        Ok(other) => {
            debug!(source = source.as_str(), kind = ?other, "payload is not an object");
            None
        }
        Err(err) => {
            debug!(source = source.as_str(), %err, "payload is not valid JSON");
            None
        }
    }
}

/// Best effort: malformed or missing payloads become `None` so a batch can
/// skip the record and move on.
pub fn extract_update(text: &str, source_metadata: Option<&Value>) -> Option<UpdateRequest> {
    let (_, payload) = parse_payload(text)?;
    Some(normalize_enhancement(&payload, source_metadata))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::records::Category;

    #[test]
    fn parses_tagged_fenced_block() {
        let text = "Here you go:\n```json\n{\"nameEN\":\"Hallgrímskirkja\",\"category\":\"ATTRACTION\"}\n```\nDone.";
        let (source, value) = parse_payload(text).unwrap();
        assert_eq!(source, ExtractionSource::Fenced);
        assert_eq!(value["nameEN"], json!("Hallgrímskirkja"));

        let update = extract_update(text, None).unwrap();
        assert_eq!(update.name_english.as_deref(), Some("Hallgrímskirkja"));
        assert_eq!(update.category, Some(Category::Attraction));
        assert_eq!(update.field_count(), 2);
    }

    #[test]
    fn parses_untagged_fence() {
        let text = "```\n{\"address\": \"Hallgrímstorg 1\"}\n```";
        let (source, _) = parse_payload(text).unwrap();
        assert_eq!(source, ExtractionSource::Fenced);
    }

    #[test]
    fn falls_back_to_bare_object() {
        let text = "The record should become {\"description\": \"A tall church\", \"rating\": 4.7} as requested.";
        let (source, value) = parse_payload(text).unwrap();
        assert_eq!(source, ExtractionSource::BareObject);
        assert_eq!(value["rating"], json!(4.7));
    }

    #[test]
    fn bare_object_spans_nested_braces() {
        let text = "result: {\"location\": {\"lat\": 64.1417, \"lng\": -21.9266}, \"nameLocal\": \"教堂\"} end";
        let update = extract_update(text, None).unwrap();
        assert_eq!(update.lat, Some(64.1417));
        assert_eq!(update.name_local.as_deref(), Some("教堂"));
    }

    #[test]
    fn short_bare_braces_are_ignored() {
        assert!(parse_payload("nothing here {a: 1}").is_none());
        assert!(parse_payload("plain prose without any payload").is_none());
    }

    #[test]
    fn malformed_fenced_json_yields_none() {
        let text = "```json\n{\"nameEN\": \"Hallgrímskirkja\", }\n```";
        assert!(extract_update(text, None).is_none());
    }

    #[test]
    fn passes_source_metadata_to_normalizer() {
        let text = "```json\n{\"nameLocal\": \"X\"}\n```";
        let metadata = json!({ "coordinates": [64.13, -21.9] });
        let update = extract_update(text, Some(&metadata)).unwrap();
        assert_eq!((update.lat, update.lng), (Some(64.13), Some(-21.9)));
    }
}
