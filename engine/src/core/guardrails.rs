//! Deterministic quality checks applied on top of the model's own review.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Minimum chapter word count per configured chapter-length tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinWordTable {
    pub short: usize,
    pub medium: usize,
    pub long: usize,
    /// Used when the project has no (recognizable) chapter-length preference.
    pub default: usize,
}

impl Default for MinWordTable {
    fn default() -> Self {
        Self {
            short: 900,
            medium: 1800,
            long: 3000,
            default: 1200,
        }
    }
}

impl MinWordTable {
    /// Resolve the minimum for a free-form preference such as `"Short ~1500w"`.
    ///
    /// Matching is by substring, checked in `short`, `medium`, `long` order.
    pub fn minimum_for(&self, chapter_length: Option<&str>) -> usize {
        let preference = chapter_length.unwrap_or_default().trim().to_lowercase();
        if preference.contains("short") {
            self.short
        } else if preference.contains("medium") {
            self.medium
        } else if preference.contains("long") {
            self.long
        } else {
            self.default
        }
    }
}

/// Findings of one guardrail evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardrailReport {
    pub issues: Vec<String>,
    pub word_count: usize,
    pub minimum_word_count: usize,
}

impl GuardrailReport {
    pub fn failed(&self) -> bool {
        !self.issues.is_empty()
    }
}

/// A level 2-6 Markdown heading at the start of a line. A `## ` buried in a
/// paragraph is not a section.
static SECTION_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*#{2,6}[ \t]+\S").expect("section heading pattern is valid")
});

/// Pure evaluator; never fails, only reports.
#[derive(Debug, Clone, Default)]
pub struct GuardrailEvaluator {
    min_words: MinWordTable,
}

impl GuardrailEvaluator {
    pub fn new(min_words: MinWordTable) -> Self {
        Self { min_words }
    }

    /// Evaluate `chapter_text` against the project's length preference.
    ///
    /// Issues are reported in fixed order: empty text, missing `##` section
    /// heading, word count below minimum.
    pub fn evaluate(&self, chapter_length: Option<&str>, chapter_text: &str) -> GuardrailReport {
        let text = chapter_text.trim();
        let word_count = text.split_whitespace().count();
        let minimum_word_count = self.min_words.minimum_for(chapter_length);

        let mut issues = Vec::new();
        if text.is_empty() {
            issues.push("Chapter content is empty.".to_string());
        }
        if !SECTION_HEADING_RE.is_match(text) {
            issues.push("Chapter is missing at least one '##' section heading.".to_string());
        }
        if word_count < minimum_word_count {
            issues.push(format!(
                "Chapter word count {word_count} is below minimum {minimum_word_count}."
            ));
        }

        GuardrailReport {
            issues,
            word_count,
            minimum_word_count,
        }
    }
}
