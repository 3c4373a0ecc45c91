//! Engine configuration stored as TOML (default `<store>/config.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::guardrails::MinWordTable;
use crate::core::state::DEFAULT_MAX_REVISIONS;
use crate::telemetry::DEFAULT_ERROR_LIMIT_CHARS;

/// Engine configuration (TOML).
///
/// Meant to be edited by hand. Every field is optional and falls back to the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Draft/review cycles allowed after the first draft.
    pub max_revisions: u32,
    pub review: ReviewConfig,
    pub guardrails: GuardrailConfig,
    pub provider: ProviderConfig,
    pub context: ContextConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    /// Scores strictly below this trigger a revision.
    pub pass_score: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardrailConfig {
    pub min_words: MinWordTable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Generation command (e.g. `["my-llm", "--json"]`). Empty means offline:
    /// every stage uses its deterministic fallback.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Extra attempts after an unusable response.
    pub json_retries: u32,
    /// Prompts above this size lose droppable sections.
    pub prompt_budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub memory_limit: usize,
    pub knowledge_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub error_limit_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_revisions: DEFAULT_MAX_REVISIONS,
            review: ReviewConfig::default(),
            guardrails: GuardrailConfig::default(),
            provider: ProviderConfig::default(),
            context: ContextConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self { pass_score: 80 }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 300,
            output_limit_bytes: 1_000_000,
            json_retries: 2,
            prompt_budget_bytes: 60_000,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            memory_limit: 5,
            knowledge_limit: 6,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            error_limit_chars: DEFAULT_ERROR_LIMIT_CHARS,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.review.pass_score > 100 {
            return Err(anyhow!("review.pass_score must be within 0..=100"));
        }
        let min_words = &self.guardrails.min_words;
        if [min_words.short, min_words.medium, min_words.long, min_words.default].contains(&0) {
            return Err(anyhow!("guardrails.min_words entries must be > 0"));
        }
        if !self.provider.command.is_empty() && self.provider.command[0].trim().is_empty() {
            return Err(anyhow!("provider.command must start with a program name"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if self.provider.output_limit_bytes == 0 {
            return Err(anyhow!("provider.output_limit_bytes must be > 0"));
        }
        if self.provider.prompt_budget_bytes < 1_000 {
            return Err(anyhow!("provider.prompt_budget_bytes must be >= 1000"));
        }
        if self.context.memory_limit == 0 {
            return Err(anyhow!("context.memory_limit must be > 0"));
        }
        if self.telemetry.error_limit_chars == 0 {
            return Err(anyhow!("telemetry.error_limit_chars must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
