//! Explicit state threaded through the chapter subgraph.
//!
//! Each node reads what it needs from [`WorkflowState`] and returns one of the
//! narrow update records below; only [`WorkflowState::apply`] writes state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::fallback::{FallbackSignal, FallbackStages};
use crate::core::review::Review;
use crate::core::types::{
    ChapterDraft, ChapterPlan, NodeTimings, Outline, OutlineChapter, Progress, Project, RunMode,
    TimingsSummary,
};

/// Progress plus per-node timings: everything the telemetry sink persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub progress: Progress,
    pub node_timings: NodeTimings,
}

/// Outline entry and retrieved snippets for the chapter being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterContext {
    pub outline: Outline,
    pub chapter_number: u32,
    pub target: OutlineChapter,
    pub memory_snippets: Vec<String>,
    pub knowledge_snippets: Vec<String>,
}

/// What the persistence collaborator hands back after storing a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedChapter {
    pub status: String,
    pub outline: Outline,
    pub chapter: ChapterDraft,
    pub metadata: Map<String, Value>,
    pub next_steps: Vec<String>,
}

/// Caller-facing result of a chapter run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterOutput {
    #[serde(flatten)]
    pub persisted: PersistedChapter,
    pub fallback_stages: FallbackStages,
    pub used_fallback: bool,
    /// Filled in by the router once `run_chapter` itself has completed.
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub timings_ms: TimingsSummary,
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub run_id: String,
    pub trace_id: String,
    pub project: Project,
    pub mode: RunMode,
    pub inputs: Map<String, Value>,
    pub output: Option<ChapterOutput>,
    pub telemetry: TelemetrySnapshot,
    pub fallback_stages: FallbackStages,
    /// Chapter number once the context node has parsed and validated the
    /// `chapter_number` input.
    pub chapter_number: Option<u32>,
    pub context: Option<ChapterContext>,
    pub plan: Option<ChapterPlan>,
    pub draft: Option<ChapterDraft>,
    pub chapter_metadata: Map<String, Value>,
    pub next_steps: Vec<String>,
    pub review: Option<Review>,
    pub revision_count: u32,
    pub max_revisions: u32,
}

/// Default revision budget per chapter.
pub const DEFAULT_MAX_REVISIONS: u32 = 2;

impl WorkflowState {
    /// Fresh state for one chapter run: no revisions, no context yet.
    pub fn for_chapter(
        run_id: &str,
        trace_id: &str,
        project: Project,
        inputs: Map<String, Value>,
        telemetry: TelemetrySnapshot,
        fallback_stages: FallbackStages,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            trace_id: trace_id.to_string(),
            project,
            mode: RunMode::Chapter,
            inputs,
            output: None,
            telemetry,
            fallback_stages,
            chapter_number: None,
            context: None,
            plan: None,
            draft: None,
            chapter_metadata: Map::new(),
            next_steps: Vec::new(),
            review: None,
            revision_count: 0,
            max_revisions: DEFAULT_MAX_REVISIONS,
        }
    }

    pub fn with_max_revisions(mut self, max_revisions: u32) -> Self {
        self.max_revisions = max_revisions;
        self
    }

    /// Critique of the previous review, trimmed; empty before the first review.
    pub fn pending_critique(&self) -> &str {
        self.review
            .as_ref()
            .map(|review| review.critique.trim())
            .unwrap_or_default()
    }

    /// Content of the previous draft, trimmed; empty before the first draft.
    pub fn previous_draft(&self) -> &str {
        self.draft
            .as_ref()
            .map(|draft| draft.content.trim())
            .unwrap_or_default()
    }

    pub fn apply(&mut self, update: NodeUpdate) {
        match update {
            NodeUpdate::Context(context) => {
                self.chapter_number = Some(context.chapter_number);
                self.context = Some(context);
            }
            NodeUpdate::Plan { plan, signal } => {
                self.fallback_stages = self.fallback_stages.merge(&signal);
                self.plan = Some(plan);
            }
            NodeUpdate::Draft(update) => {
                self.fallback_stages = self.fallback_stages.merge(&update.signal);
                self.draft = Some(update.draft);
                self.chapter_metadata = update.metadata;
                self.next_steps = update.next_steps;
                self.revision_count = update.revision_count;
            }
            NodeUpdate::Review { review, signal } => {
                self.fallback_stages = self.fallback_stages.merge(&signal);
                self.review = Some(review);
            }
            NodeUpdate::Persist { output, project } => {
                self.output = Some(*output);
                self.project = *project;
            }
        }
    }
}

/// Draft node result.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftUpdate {
    pub draft: ChapterDraft,
    pub metadata: Map<String, Value>,
    pub next_steps: Vec<String>,
    pub revision_count: u32,
    pub signal: FallbackSignal,
}

/// Narrow per-node state change.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeUpdate {
    Context(ChapterContext),
    Plan {
        plan: ChapterPlan,
        signal: FallbackSignal,
    },
    Draft(DraftUpdate),
    Review {
        review: Review,
        signal: FallbackSignal,
    },
    /// Stored chapter output and the project as persistence left it.
    Persist {
        output: Box<ChapterOutput>,
        project: Box<Project>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkflowState {
        WorkflowState::for_chapter(
            "run-1",
            "trace-1",
            Project::new("p1", "Book"),
            Map::new(),
            TelemetrySnapshot::default(),
            FallbackStages::new(),
        )
    }

    #[test]
    fn fresh_state_has_no_revisions_and_default_budget() {
        let state = state();
        assert_eq!(state.revision_count, 0);
        assert_eq!(state.max_revisions, DEFAULT_MAX_REVISIONS);
        assert_eq!(state.pending_critique(), "");
        assert_eq!(state.previous_draft(), "");
        assert!(state.chapter_number.is_none());
        assert!(state.output.is_none());
    }

    #[test]
    fn updates_merge_fallback_signals_in_order() {
        let mut state = state();
        state.apply(NodeUpdate::Plan {
            plan: ChapterPlan::default(),
            signal: FallbackSignal::fallback("chapter_plan"),
        });
        state.apply(NodeUpdate::Draft(DraftUpdate {
            draft: ChapterDraft {
                content: "  body  ".to_string(),
                ..ChapterDraft::default()
            },
            metadata: Map::new(),
            next_steps: Vec::new(),
            revision_count: 0,
            signal: FallbackSignal::none(),
        }));
        state.apply(NodeUpdate::Review {
            review: Review {
                critique: " Add depth. ".to_string(),
                ..Review::default()
            },
            signal: FallbackSignal::fallback("chapter_review"),
        });

        assert_eq!(
            state.fallback_stages.as_slice(),
            ["chapter_plan", "chapter_review"]
        );
        assert_eq!(state.pending_critique(), "Add depth.");
        assert_eq!(state.previous_draft(), "body");
    }
}
