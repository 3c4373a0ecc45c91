//! Merge of the model's review with the deterministic guardrail report.
//!
//! The merged decision (`effective_should_revise`) is computed once here and
//! stored on [`Review`]; the chapter transition only reads the stored field.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::core::guardrails::GuardrailReport;

/// Critique used when revision is triggered but the model left none.
pub const SYNTHESIZED_CRITIQUE: &str =
    "Revise for stronger concept alignment, add depth, and improve section structure.";

/// Review exactly as the provider returned it (loosely typed).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReview {
    /// Raw score; numbers and numeric strings are accepted, anything else is 0.
    #[serde(default, deserialize_with = "lenient_score")]
    pub score: i64,
    #[serde(default)]
    pub should_revise: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub critique: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient_score<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    Ok(parse_score(&raw))
}

/// Parse a score from a JSON number or numeric string, truncating fractions.
pub fn parse_score(raw: &Value) -> i64 {
    let parsed = match raw {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(value) if value.is_finite() => value.trunc() as i64,
        _ => 0,
    }
}

/// Final review result for one review node execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub score: u8,
    /// The model's own opinion.
    pub should_revise: bool,
    /// `should_revise || score < pass_score || guardrail_fail`.
    pub effective_should_revise: bool,
    pub guardrail_fail: bool,
    pub guardrail_issues: Vec<String>,
    pub word_count: usize,
    pub minimum_word_count: usize,
    /// Model issues followed by guardrail issues, deduplicated.
    pub issues: Vec<String>,
    pub critique: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Review {
    /// Combine the model review with the guardrail report.
    ///
    /// A revision with an empty critique gets [`SYNTHESIZED_CRITIQUE`] so the
    /// next draft always has something to act on.
    pub fn merge(model: ModelReview, guardrails: GuardrailReport, pass_score: u8) -> Self {
        let score = model.score.clamp(0, 100) as u8;

        let mut issues: Vec<String> = Vec::new();
        for issue in model.issues.iter().chain(&guardrails.issues) {
            let issue = issue.trim();
            if !issue.is_empty() && !issues.iter().any(|seen| seen == issue) {
                issues.push(issue.to_string());
            }
        }

        let guardrail_fail = guardrails.failed();
        let effective_should_revise = model.should_revise || score < pass_score || guardrail_fail;

        let mut critique = model.critique.trim().to_string();
        if effective_should_revise && critique.is_empty() {
            critique = SYNTHESIZED_CRITIQUE.to_string();
        }

        Self {
            score,
            should_revise: model.should_revise,
            effective_should_revise,
            guardrail_fail,
            guardrail_issues: guardrails.issues,
            word_count: guardrails.word_count,
            minimum_word_count: guardrails.minimum_word_count,
            issues,
            critique,
            extra: model.extra,
        }
    }
}
