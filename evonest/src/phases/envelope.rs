//! Phase envelope parsing.
//!
//! Each phase expects the LM's final message to contain a JSON object with a
//! known top-level shape. Parser policy: locate the first syntactically
//! valid JSON value anywhere in the text (models wrap envelopes in prose and
//! markdown fences), reject envelopes missing required keys, and accept
//! arrays partially — invalid entries are dropped, valid ones kept.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::state::types::Priority;

/// Find the first parseable JSON value in free-form text.
pub fn extract_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for (start, &byte) in bytes.iter().enumerate() {
        if byte != b'{' && byte != b'[' {
            continue;
        }
        if let Some(end) = matching_close(&text[start..]) {
            if let Ok(value) = serde_json::from_str(&text[start..start + end]) {
                return Some(value);
            }
        }
    }
    None
}

/// Byte length of the balanced JSON value starting at the first byte of
/// `text`, honoring string literals and escapes.
fn matching_close(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let open = bytes[0];
    let close = if open == b'{' { b'}' } else { b']' };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, &byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(index + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the envelope object for a phase, requiring the named keys.
fn envelope_object(text: &str, phase: &str, required: &[&str]) -> EngineResult<Value> {
    let value = extract_json(text)
        .ok_or_else(|| EngineError::envelope(phase, "no JSON value in final message"))?;
    let object = value
        .as_object()
        .ok_or_else(|| EngineError::envelope(phase, "envelope is not a JSON object"))?;
    for key in required {
        if !object.contains_key(*key) {
            return Err(EngineError::envelope(
                phase,
                format!("missing required key '{key}'"),
            ));
        }
    }
    Ok(value)
}

/// Deserialize an array field entry-by-entry, dropping invalid entries.
fn lenient_array<T: DeserializeOwned>(value: Option<&Value>, phase: &str, field: &str) -> Vec<T> {
    let Some(Value::Array(entries)) = value else {
        return Vec::new();
    };
    let mut parsed = Vec::with_capacity(entries.len());
    let mut dropped = 0;
    for entry in entries {
        match serde_json::from_value::<T>(entry.clone()) {
            Ok(item) => parsed.push(item),
            Err(_) => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!(phase, field, dropped, "invalid envelope entries dropped");
    }
    parsed
}

fn default_priority() -> Priority {
    Priority::Medium
}

fn default_category() -> String {
    "refactor".to_string()
}

/// One improvement row inside the observe envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ImprovementEntry {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Observe phase envelope.
#[derive(Debug, Clone)]
pub struct ObserveEnvelope {
    pub improvements: Vec<ImprovementEntry>,
    pub observations: String,
}

impl ObserveEnvelope {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let value = envelope_object(text, "observe", &["improvements"])?;
        Ok(Self {
            improvements: lenient_array(value.get("improvements"), "observe", "improvements"),
            observations: value
                .get("observations")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Change risk declared by the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Plan phase envelope. `selected_improvement: null` means "nothing worth
/// doing" and terminates the remaining cycles of the run.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PlanEnvelope {
    pub selected_improvement: Option<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub files_to_read: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub expected_outcome: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub commit_message: String,
}

impl PlanEnvelope {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let value = envelope_object(text, "plan", &["selected_improvement"])?;
        serde_json::from_value(value).map_err(|e| EngineError::envelope("plan", e.to_string()))
    }

    /// Every path the plan intends to write.
    pub fn write_targets(&self) -> Vec<String> {
        self.files_to_modify
            .iter()
            .chain(self.files_to_create.iter())
            .cloned()
            .collect()
    }
}

/// Execute phase envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteEnvelope {
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl ExecuteEnvelope {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let value = envelope_object(text, "execute", &[])?;
        serde_json::from_value(value).map_err(|e| EngineError::envelope("execute", e.to_string()))
    }
}

/// A persona proposed by meta-observe. The id is derived from the name when
/// absent.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPersonaEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub group: Option<crate::mutation::PersonaGroup>,
    pub perspective: String,
}

/// An adversarial proposed by meta-observe.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAdversarialEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub challenge: String,
}

/// A stimulus dropped by meta-observe.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoStimulusEntry {
    pub title: String,
    pub content: String,
}

/// Meta-observe gate envelope.
#[derive(Debug, Clone)]
pub struct MetaObserveEnvelope {
    pub new_personas: Vec<NewPersonaEntry>,
    pub new_adversarials: Vec<NewAdversarialEntry>,
    pub auto_stimuli: Vec<AutoStimulusEntry>,
    pub advice: Option<String>,
}

impl MetaObserveEnvelope {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let value = envelope_object(text, "meta-observe", &["advice"])?;
        Ok(Self {
            new_personas: lenient_array(value.get("new_personas"), "meta-observe", "new_personas"),
            new_adversarials: lenient_array(
                value.get("new_adversarials"),
                "meta-observe",
                "new_adversarials",
            ),
            auto_stimuli: lenient_array(value.get("auto_stimuli"), "meta-observe", "auto_stimuli"),
            advice: value
                .get("advice")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// One finding inside the scout envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoutFinding {
    pub title: String,
    pub source_url: String,
    pub relevance_score: u8,
    #[serde(default)]
    pub summary: String,
}

/// Scout gate envelope.
#[derive(Debug, Clone)]
pub struct ScoutEnvelope {
    pub findings: Vec<ScoutFinding>,
}

impl ScoutEnvelope {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let value = envelope_object(text, "scout", &["findings"])?;
        Ok(Self {
            findings: lenient_array(value.get("findings"), "scout", "findings"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_json_from_prose() {
        let text = "Here's what I found:\n```json\n{\"a\": 1}\n```\nand also [2,3].";
        let value = extract_json(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn skips_unbalanced_candidates() {
        let text = "broken { not json } then {\"ok\": true}";
        let value = extract_json(text).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_matching() {
        let text = r#"{"msg": "use {braces} and \" quotes", "n": 1}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn no_json_is_none() {
        assert!(extract_json("just words").is_none());
    }

    #[test]
    fn observe_envelope_partial_array() {
        let text = r#"{
            "improvements": [
                {"title": "Fix lexer", "category": "bug", "priority": "high"},
                {"category": "missing title, dropped"},
                {"title": "Add docs"}
            ],
            "observations": "lexer is fragile"
        }"#;
        let envelope = ObserveEnvelope::parse(text).unwrap();
        assert_eq!(envelope.improvements.len(), 2);
        assert_eq!(envelope.improvements[0].title, "Fix lexer");
        assert_eq!(envelope.improvements[0].priority, Priority::High);
        assert_eq!(envelope.improvements[1].category, "refactor");
        assert_eq!(envelope.observations, "lexer is fragile");
    }

    #[test]
    fn observe_requires_improvements_key() {
        let err = ObserveEnvelope::parse(r#"{"observations": "x"}"#).unwrap_err();
        assert!(matches!(err, EngineError::Envelope { .. }));
    }

    #[test]
    fn plan_envelope_null_selection() {
        let envelope = PlanEnvelope::parse(r#"{"selected_improvement": null}"#).unwrap();
        assert!(envelope.selected_improvement.is_none());
    }

    #[test]
    fn plan_envelope_full() {
        let envelope = PlanEnvelope::parse(
            r#"{
                "selected_improvement": "fix-lexer",
                "steps": ["read", "edit"],
                "files_to_modify": ["src/lexer.rs"],
                "files_to_create": ["tests/lexer.rs"],
                "expected_outcome": "lexer handles unicode",
                "risk_level": "low",
                "commit_message": "fix lexer unicode handling"
            }"#,
        )
        .unwrap();
        assert_eq!(envelope.selected_improvement.as_deref(), Some("fix-lexer"));
        assert_eq!(envelope.risk_level, RiskLevel::Low);
        assert_eq!(
            envelope.write_targets(),
            vec!["src/lexer.rs", "tests/lexer.rs"]
        );
    }

    #[test]
    fn plan_without_selection_key_is_malformed() {
        let err = PlanEnvelope::parse(r#"{"steps": []}"#).unwrap_err();
        assert!(matches!(err, EngineError::Envelope { .. }));
    }

    #[test]
    fn scout_drops_entries_missing_required_keys() {
        let envelope = ScoutEnvelope::parse(
            r#"{"findings": [
                {"title": "New lint crate", "source_url": "https://x", "relevance_score": 8},
                {"title": "no url or score"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(envelope.findings.len(), 1);
        assert_eq!(envelope.findings[0].relevance_score, 8);
    }

    #[test]
    fn meta_envelope_parses_all_sections() {
        let envelope = MetaObserveEnvelope::parse(
            r#"{
                "new_personas": [{"name": "Cache Whisperer", "perspective": "caching"}],
                "new_adversarials": [{"name": "Fuzzer", "challenge": "fuzz it"}],
                "auto_stimuli": [{"title": "look at io", "content": "io is slow"}],
                "advice": "focus on io for 5 cycles"
            }"#,
        )
        .unwrap();
        assert_eq!(envelope.new_personas.len(), 1);
        assert!(envelope.new_personas[0].id.is_none());
        assert_eq!(envelope.advice.as_deref(), Some("focus on io for 5 cycles"));
    }
}
