//! Interpretation Parsing
//!
//! The model's reply is untrusted text. It is first located and parsed into a
//! `serde_json::Value`, then narrowed field by field into an [`AIInterpretation`].
//! Anything that cannot be narrowed is dropped; a reply without a usable base
//! fails closed (`None`).

use crate::fragments::{FragmentId, FragmentLibrary};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

lazy_static! {
    static ref JSON_FENCE_RE: Regex = Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretedFragments {
    pub base: FragmentId,
    #[serde(default)]
    pub joins: Vec<FragmentId>,
    #[serde(default)]
    pub filters: Vec<FragmentId>,
    #[serde(default)]
    pub columns: Vec<FragmentId>,
    #[serde(default)]
    pub aggregations: Vec<FragmentId>,
    #[serde(default)]
    pub ordering: Vec<FragmentId>,
}

/// A question the model wants the user to answer before a query is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clarification {
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AIInterpretation {
    pub fragments: InterpretedFragments,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub clarifications: Vec<Clarification>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl AIInterpretation {
    /// True when the interpretation must go back to the user instead of
    /// being composed.
    pub fn needs_clarification(&self, threshold: f64) -> bool {
        !self.clarifications.is_empty() && self.confidence < threshold
    }
}

/// Pull the JSON object out of a model reply: fenced block first, then the
/// span from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let candidate = JSON_FENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);

    let start = candidate.find('{')?;
    let end = candidate.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&candidate[start..=end])
}

/// Parse and normalize a model reply.
///
/// `default_base` is used when the reply names a base that is not a known
/// base fragment; if it is not itself a known base, the library's first base
/// is used instead.
pub fn parse_interpretation(
    text: &str,
    library: &FragmentLibrary,
    default_base: &str,
) -> Option<AIInterpretation> {
    let json = extract_json_object(text)?;
    let value: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => {
            debug!("Interpretation is not valid JSON: {}", e);
            return None;
        }
    };
    normalize_interpretation(&value, library, default_base)
}

/// Narrow an already-parsed JSON value into an [`AIInterpretation`].
pub fn normalize_interpretation(
    value: &Value,
    library: &FragmentLibrary,
    default_base: &str,
) -> Option<AIInterpretation> {
    let fragments = value.get("fragments")?;
    let requested_base = fragments
        .get("base")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|b| !b.is_empty())?;

    let mut warnings: Vec<String> = string_list(value.get("warnings"));

    let base_ids = library.base_ids();
    let base = if base_ids.contains(&requested_base) {
        requested_base.to_string()
    } else {
        let fallback = if base_ids.contains(&default_base) {
            Some(default_base)
        } else {
            base_ids.first().copied()
        };
        match fallback {
            Some(fallback) => {
                warn!(
                    "Interpretation named unknown base '{}', substituting '{}'",
                    requested_base, fallback
                );
                warnings.push(format!(
                    "Base fragment '{}' is not a known base; using '{}' instead",
                    requested_base, fallback
                ));
                fallback.to_string()
            }
            // Nothing to substitute; composition reports the missing base.
            None => requested_base.to_string(),
        }
    };

    let fragments = InterpretedFragments {
        base,
        joins: string_list(fragments.get("joins")),
        filters: filter_ids(fragments.get("filters")),
        columns: string_list(fragments.get("columns")),
        aggregations: string_list(fragments.get("aggregations")),
        ordering: string_list(fragments.get("ordering")),
    };

    let parameters = value
        .get("parameters")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    Some(AIInterpretation {
        fragments,
        parameters,
        confidence: confidence(value.get("confidence")),
        clarifications: clarifications(value.get("clarifications")),
        warnings,
    })
}

/// Keep only string entries of an array.
fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Filters sometimes come back as objects; reduce them to their id.
fn filter_ids(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(obj) => obj
                        .get("id")
                        .or_else(|| obj.get("fragmentId"))
                        .and_then(Value::as_str),
                    _ => None,
                })
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn confidence(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn clarifications(value: Option<&Value>) -> Vec<Clarification> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(q) if !q.trim().is_empty() => Some(Clarification {
                        question: q.trim().to_string(),
                        options: Vec::new(),
                        field: None,
                    }),
                    Value::Object(obj) => {
                        let question = obj
                            .get("question")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|q| !q.is_empty())?;
                        let options = obj
                            .get("options")
                            .and_then(Value::as_array)
                            .map(|opts| {
                                opts.iter()
                                    .filter_map(|o| match o {
                                        Value::String(s) => Some(s.clone()),
                                        Value::Object(o) => o
                                            .get("label")
                                            .or_else(|| o.get("id"))
                                            .and_then(Value::as_str)
                                            .map(str::to_string),
                                        _ => None,
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        Some(Clarification {
                            question: question.to_string(),
                            options,
                            field: obj.get("field").and_then(Value::as_str).map(str::to_string),
                        })
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::test_support::fragment;
    use crate::fragments::FragmentType;

    fn library() -> FragmentLibrary {
        FragmentLibrary::from_fragments(vec![
            fragment("students_base", FragmentType::Base, "SELECT s.ID FROM STU s"),
            fragment("enrollment_base", FragmentType::Base, "SELECT e.ID FROM ENR e"),
            fragment("has_iep", FragmentType::Filter, "s.IEP = 'Y'"),
        ])
    }

    #[test]
    fn test_parses_fenced_json() {
        let reply = "Sure!\n```json\n{\"fragments\": {\"base\": \"students_base\", \"filters\": [\"has_iep\"]}, \"confidence\": 0.92}\n```\nLet me know.";
        let interp = parse_interpretation(reply, &library(), "students_base").unwrap();
        assert_eq!(interp.fragments.base, "students_base");
        assert_eq!(interp.fragments.filters, vec!["has_iep"]);
        assert!((interp.confidence - 0.92).abs() < f64::EPSILON);
        assert!(interp.parameters.is_empty());
        assert!(interp.warnings.is_empty());
    }

    #[test]
    fn test_parses_unfenced_json_with_prose() {
        let reply = "Here you go: {\"fragments\": {\"base\": \"enrollment_base\"}} hope that helps";
        let interp = parse_interpretation(reply, &library(), "students_base").unwrap();
        assert_eq!(interp.fragments.base, "enrollment_base");
        assert_eq!(interp.confidence, 0.0);
    }

    #[test]
    fn test_invalid_json_is_none() {
        assert!(parse_interpretation("{not json", &library(), "students_base").is_none());
        assert!(parse_interpretation("no braces at all", &library(), "students_base").is_none());
    }

    #[test]
    fn test_missing_base_is_none() {
        let reply = r#"{"fragments": {"filters": ["has_iep"]}}"#;
        assert!(parse_interpretation(reply, &library(), "students_base").is_none());
    }

    #[test]
    fn test_unknown_base_is_substituted_with_warning() {
        let reply = r#"{"fragments": {"base": "teachers_base"}}"#;
        let interp = parse_interpretation(reply, &library(), "students_base").unwrap();
        assert_eq!(interp.fragments.base, "students_base");
        assert_eq!(interp.warnings.len(), 1);
    }

    #[test]
    fn test_non_base_fragment_as_base_is_substituted() {
        let reply = r#"{"fragments": {"base": "has_iep"}}"#;
        let interp = parse_interpretation(reply, &library(), "not_a_base").unwrap();
        assert_eq!(interp.fragments.base, "students_base");
    }

    #[test]
    fn test_filter_objects_are_coerced() {
        let reply = r#"{"fragments": {"base": "students_base",
            "filters": ["has_iep", {"id": "school_jefferson"}, {"fragmentId": "grade_9"}, {"name": "x"}, 42],
            "joins": ["enrollment_join", 7, null, {"id": "ignored"}]}}"#;
        let interp = parse_interpretation(reply, &library(), "students_base").unwrap();
        assert_eq!(
            interp.fragments.filters,
            vec!["has_iep", "school_jefferson", "grade_9"]
        );
        assert_eq!(interp.fragments.joins, vec!["enrollment_join"]);
    }

    #[test]
    fn test_clarifications_and_threshold() {
        let reply = r#"{"fragments": {"base": "students_base"}, "confidence": 0.5,
            "clarifications": [{"question": "Which school?", "options": ["Jefferson", {"label": "Lincoln"}]}, "Which year?"]}"#;
        let interp = parse_interpretation(reply, &library(), "students_base").unwrap();
        assert_eq!(interp.clarifications.len(), 2);
        assert_eq!(interp.clarifications[0].options, vec!["Jefferson", "Lincoln"]);
        assert!(interp.needs_clarification(0.7));

        let confident = AIInterpretation {
            confidence: 0.9,
            ..interp
        };
        assert!(!confident.needs_clarification(0.7));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let reply = r#"{"fragments": {"base": "students_base"}, "confidence": "7"}"#;
        let interp = parse_interpretation(reply, &library(), "students_base").unwrap();
        assert_eq!(interp.confidence, 1.0);
    }
}
