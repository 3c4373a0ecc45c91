//! Shared deterministic types for engine core logic.
//!
//! These types define stable contracts between the state machine, the
//! telemetry tracker, and the external collaborators. They carry no I/O and
//! serialize deterministically (ordered maps) so persisted snapshots are stable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Execution mode selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Toc,
    RefineToc,
    Chapter,
    Export,
    ProfileAssistant,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Toc => "toc",
            RunMode::RefineToc => "refine_toc",
            RunMode::Chapter => "chapter",
            RunMode::Export => "export",
            RunMode::ProfileAssistant => "profile_assistant",
        }
    }

    /// Telemetry node name of the top-level handler for this mode.
    pub fn node_name(self) -> &'static str {
        match self {
            RunMode::Toc => "run_toc",
            RunMode::RefineToc => "run_refine_toc",
            RunMode::Chapter => "run_chapter",
            RunMode::Export => "run_export",
            RunMode::ProfileAssistant => "run_profile_assistant",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "toc" => Ok(RunMode::Toc),
            "refine_toc" => Ok(RunMode::RefineToc),
            "chapter" => Ok(RunMode::Chapter),
            "export" => Ok(RunMode::Export),
            "profile_assistant" => Ok(RunMode::ProfileAssistant),
            _ => Err(EngineError::InvalidMode(raw.to_string())),
        }
    }
}

/// Per-node lifecycle status recorded in [`Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
}

/// Live snapshot of which node is running/completed/failed for a run.
///
/// Transitions never mutate `self`; each returns a fresh copy so a snapshot
/// handed to a sink (or held by a caller) stays valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current_node: String,
    pub node_status: BTreeMap<String, NodeStatus>,
    /// Completion order, without duplicates.
    pub completed_nodes: Vec<String>,
    pub revision_count: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_meta: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Progress {
    pub fn started(&self, node: &str, revision_count: u32) -> Self {
        let mut next = self.clone();
        next.current_node = node.to_string();
        next.node_status
            .insert(node.to_string(), NodeStatus::Running);
        next.revision_count = revision_count;
        next
    }

    pub fn completed(&self, node: &str, revision_count: u32, meta: Option<Value>) -> Self {
        let mut next = self.clone();
        next.current_node = node.to_string();
        next.node_status
            .insert(node.to_string(), NodeStatus::Completed);
        if !next.completed_nodes.iter().any(|done| done == node) {
            next.completed_nodes.push(node.to_string());
        }
        next.revision_count = revision_count;
        if let Some(meta) = meta {
            next.node_meta.insert(node.to_string(), meta);
        }
        next
    }

    /// Mark `node` failed, keeping at most `error_limit` characters of `error`.
    pub fn failed(&self, node: &str, revision_count: u32, error: &str, error_limit: usize) -> Self {
        let mut next = self.clone();
        next.current_node = node.to_string();
        next.node_status.insert(node.to_string(), NodeStatus::Failed);
        next.revision_count = revision_count;
        next.last_error = Some(truncate_chars(error, error_limit));
        next
    }
}

/// Append-only map from `"<node>_ms"` to elapsed milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeTimings(BTreeMap<String, u64>);

impl NodeTimings {
    pub fn key_for(node: &str) -> String {
        format!("{node}_ms")
    }

    /// Copy of `self` with `node`'s duration recorded.
    pub fn with(&self, node: &str, elapsed_ms: u64) -> Self {
        let mut next = self.clone();
        next.0.insert(Self::key_for(node), elapsed_ms);
        next
    }

    pub fn get(&self, node: &str) -> Option<u64> {
        self.0.get(&Self::key_for(node)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Timings block attached to a run's final output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingsSummary {
    pub total_ms: u64,
    pub nodes: NodeTimings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Draft,
    Outlined,
    Writing,
    ReadyToExport,
    Exported,
}

/// Book project, owned by the caller. The engine reads it and asks
/// collaborators to persist changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub target_audience: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default = "default_target_word_count")]
    pub target_word_count: u32,
    #[serde(default)]
    pub status: ProjectStatus,
    /// Free-form author brief (`chapterLength`, `richElements`, ...).
    #[serde(default)]
    pub profile: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<Outline>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_target_word_count() -> u32 {
    30_000
}

impl Project {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            genre: String::new(),
            target_audience: String::new(),
            language: String::new(),
            tone: String::new(),
            target_word_count: default_target_word_count(),
            status: ProjectStatus::Draft,
            profile: Map::new(),
            outline: None,
            metadata: Map::new(),
        }
    }

    /// Configured chapter-length preference, if any (e.g. `"Short ~1500w"`).
    pub fn chapter_length(&self) -> Option<&str> {
        self.profile.get("chapterLength").and_then(Value::as_str)
    }

    /// Requested rich element types, canonicalized and deduplicated.
    pub fn requested_rich_elements(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        let Some(Value::Array(items)) = self.profile.get("richElements") else {
            return out;
        };
        for item in items {
            let Some(raw) = item.as_str() else { continue };
            if let Some(kind) = canonical_rich_element(raw)
                && !out.contains(&kind)
            {
                out.push(kind);
            }
        }
        out
    }
}

fn canonical_rich_element(raw: &str) -> Option<&'static str> {
    let normalized = raw
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let kind = match normalized.as_str() {
        "table" | "tables" => "table",
        "flowchart" | "flowcharts" => "flowchart",
        "figure" | "figures" | "figures diagrams" | "diagram" | "diagrams" => "figure",
        "callout" | "callouts" | "callout box" | "callout boxes" => "callout",
        "code" | "code block" | "code blocks" => "code_block",
        "quote" | "quotes" => "quote",
        "list" | "lists" => "list",
        _ => return None,
    };
    Some(kind)
}

/// Normalized book outline: chapters numbered `1..=N`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub chapters: Vec<OutlineChapter>,
}

impl Outline {
    pub fn chapter(&self, number: u32) -> Option<&OutlineChapter> {
        self.chapters.iter().find(|chapter| chapter.number == number)
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    /// Outline title for `number`, or `Chapter <number>`.
    pub fn chapter_title(&self, number: u32) -> String {
        self.chapter(number)
            .map(|chapter| chapter.title.trim())
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Chapter {number}"))
    }

    pub fn bullet_points(&self, number: u32) -> &[String] {
        self.chapter(number)
            .map(|chapter| chapter.bullet_points.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineChapter {
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub bullet_points: Vec<String>,
}

/// Structured writing plan for one chapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterPlan {
    #[serde(default)]
    pub chapter_number: u32,
    #[serde(default)]
    pub chapter_title: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub sections: Vec<PlanSection>,
    #[serde(default)]
    pub continuity_notes: Vec<String>,
    #[serde(default)]
    pub concept_alignment: String,
    #[serde(default)]
    pub rich_elements_plan: Vec<RichElementSuggestion>,
    /// Anything else the provider returned (visual specs, etc.).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSection {
    #[serde(default)]
    pub heading: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub evidence_or_example: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichElementSuggestion {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub required: bool,
}

/// Chapter text as produced by a draft/revise call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterDraft {
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    #[default]
    Pending,
    Generated,
}

/// Chapter as held by the persistence collaborator, keyed by `number`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChapter {
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub status: ChapterStatus,
}

impl StoredChapter {
    pub fn pending(number: u32, title: &str) -> Self {
        Self {
            number,
            title: title.trim().to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

/// Persisted record of one run. The engine reads `mode`/`input` and writes
/// `output`, `timings`, status and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub trace_id: String,
    pub project_id: String,
    /// Raw mode string; validated when the run executes.
    pub mode: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub timings: Map<String, Value>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// Truncate to at most `limit` characters (not bytes).
pub fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// First 220 characters of `content` on one line, elided as `...` when longer.
pub fn summarize(content: &str) -> String {
    let flat = content.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() > 220 {
        format!("{}...", truncate_chars(flat, 217))
    } else {
        flat.to_string()
    }
}
