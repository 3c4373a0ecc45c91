//! Aggregation of fallback markers across independently degrading stages.

use serde::{Deserialize, Serialize};

/// Fallback marker reported by one stage's payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSignal {
    #[serde(default)]
    pub used_fallback: bool,
    #[serde(default)]
    pub fallback_stage: String,
    /// Stages already aggregated by the producer (single-shot modes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_stages: Vec<String>,
}

impl FallbackSignal {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fallback(stage: &str) -> Self {
        Self {
            used_fallback: true,
            fallback_stage: stage.to_string(),
            fallback_stages: Vec::new(),
        }
    }
}

/// Insertion-ordered set of stage names that fell back during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackStages(Vec<String>);

impl FallbackStages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new set with `signal`'s stages appended.
    ///
    /// Explicit `fallback_stages` come first, then `fallback_stage` when
    /// `used_fallback` is set. Names are trimmed; empty names and names
    /// already present are dropped.
    pub fn merge(&self, signal: &FallbackSignal) -> Self {
        let mut next = self.clone();
        for stage in &signal.fallback_stages {
            next.insert(stage);
        }
        if signal.used_fallback {
            next.insert(&signal.fallback_stage);
        }
        next
    }

    fn insert(&mut self, stage: &str) {
        let stage = stage.trim();
        if stage.is_empty() || self.contains(stage) {
            return;
        }
        self.0.push(stage.to_string());
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.0.iter().any(|existing| existing == stage)
    }

    pub fn used_fallback(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<S: AsRef<str>> FromIterator<S> for FallbackStages {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut stages = FallbackStages::new();
        for stage in iter {
            stages.insert(stage.as_ref());
        }
        stages
    }
}
