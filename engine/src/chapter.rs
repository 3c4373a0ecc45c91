//! Chapter subgraph: retrieve context, plan, draft, review, then either loop
//! back to draft or persist.
//!
//! The graph is a plain enum with a transition function. The only cycle is
//! `Draft -> Review -> Draft`, bounded by `max_revisions`: after at most
//! `max_revisions + 1` draft/review cycles the chapter is persisted whatever
//! the review says.

use anyhow::{Result, anyhow};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::core::guardrails::GuardrailEvaluator;
use crate::core::review::Review;
use crate::core::state::{ChapterContext, ChapterOutput, DraftUpdate, NodeUpdate, WorkflowState};
use crate::io::config::{ContextConfig, EngineConfig};
use crate::io::store::BookStore;
use crate::provider::{ChapterRequest, DraftRequest, GenerationProvider, ReviewRequest};
use crate::telemetry::{NodeEnd, ProgressTracker};
use crate::workflow::{PersistRequest, persist_chapter, prepare_chapter_context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterNode {
    RetrieveContext,
    Plan,
    Draft,
    Review,
    Persist,
}

impl ChapterNode {
    pub const INITIAL: ChapterNode = ChapterNode::RetrieveContext;

    /// Telemetry name of the node.
    pub fn name(self) -> &'static str {
        match self {
            ChapterNode::RetrieveContext => "chapter_retrieve_context",
            ChapterNode::Plan => "chapter_plan",
            ChapterNode::Draft => "chapter_draft",
            ChapterNode::Review => "chapter_review",
            ChapterNode::Persist => "chapter_persist",
        }
    }

    /// Node to run after `self` has updated `state`; `None` once persisted.
    pub fn next(self, state: &WorkflowState) -> Option<ChapterNode> {
        match self {
            ChapterNode::RetrieveContext => Some(ChapterNode::Plan),
            ChapterNode::Plan => Some(ChapterNode::Draft),
            ChapterNode::Draft => Some(ChapterNode::Review),
            ChapterNode::Review if should_revise(state) => Some(ChapterNode::Draft),
            ChapterNode::Review => Some(ChapterNode::Persist),
            ChapterNode::Persist => None,
        }
    }
}

/// Another draft is owed when the stored review asks for one and the
/// revision budget is not spent.
pub fn should_revise(state: &WorkflowState) -> bool {
    let requested = state
        .review
        .as_ref()
        .is_some_and(|review| review.effective_should_revise);
    requested && state.revision_count < state.max_revisions
}

pub struct ChapterSubgraph<'a> {
    provider: &'a dyn GenerationProvider,
    store: &'a dyn BookStore,
    tracker: &'a ProgressTracker<'a>,
    guardrails: GuardrailEvaluator,
    pass_score: u8,
    limits: ContextConfig,
}

impl<'a> ChapterSubgraph<'a> {
    pub fn new(
        provider: &'a dyn GenerationProvider,
        store: &'a dyn BookStore,
        tracker: &'a ProgressTracker<'a>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            provider,
            store,
            tracker,
            guardrails: GuardrailEvaluator::new(config.guardrails.min_words),
            pass_score: config.review.pass_score,
            limits: config.context.clone(),
        }
    }

    /// Drive `state` from the initial node to `Persist`.
    ///
    /// Node errors abort the run and are returned unchanged; `state` keeps
    /// whatever was applied before the failure, including telemetry.
    #[instrument(skip_all, fields(run_id = %state.run_id))]
    pub fn run(&self, state: &mut WorkflowState) -> Result<()> {
        let mut node = Some(ChapterNode::INITIAL);
        while let Some(current) = node {
            self.step(current, state)?;
            node = current.next(state);
        }
        info!(
            revision_count = state.revision_count,
            fallback_stages = ?state.fallback_stages.as_slice(),
            "chapter subgraph finished"
        );
        Ok(())
    }

    /// Run one node inside the tracker envelope and apply its update.
    fn step(&self, node: ChapterNode, state: &mut WorkflowState) -> Result<()> {
        let mut telemetry = std::mem::take(&mut state.telemetry);
        let revision_count = state.revision_count;
        let snapshot: &WorkflowState = state;
        let outcome = self.tracker.node(
            &mut telemetry,
            node.name(),
            revision_count,
            || self.execute(node, snapshot),
            |update| node_end(update, snapshot),
        );
        state.telemetry = telemetry;
        state.apply(outcome?);
        Ok(())
    }

    fn execute(&self, node: ChapterNode, state: &WorkflowState) -> Result<NodeUpdate> {
        match node {
            ChapterNode::RetrieveContext => self.retrieve_context(state),
            ChapterNode::Plan => self.plan(state),
            ChapterNode::Draft => self.draft(state),
            ChapterNode::Review => self.review(state),
            ChapterNode::Persist => self.persist(state),
        }
    }

    fn retrieve_context(&self, state: &WorkflowState) -> Result<NodeUpdate> {
        let context = prepare_chapter_context(
            self.store,
            &state.project,
            state.inputs.get("chapter_number"),
            &self.limits,
        )?;
        Ok(NodeUpdate::Context(context))
    }

    fn plan(&self, state: &WorkflowState) -> Result<NodeUpdate> {
        let request = chapter_request(state)?;
        let payload = self.provider.plan_chapter(&request)?;
        debug!(
            sections = payload.value.sections.len(),
            used_fallback = payload.used_fallback(),
            "chapter plan ready"
        );
        Ok(NodeUpdate::Plan {
            plan: payload.value,
            signal: payload.signal,
        })
    }

    fn draft(&self, state: &WorkflowState) -> Result<NodeUpdate> {
        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| anyhow!("draft requires a chapter plan"))?;
        let critique = state.pending_critique();
        let payload = self.provider.draft_or_revise(&DraftRequest {
            chapter: chapter_request(state)?,
            plan,
            critique,
            previous_draft: state.previous_draft(),
        })?;
        // Only a draft that answers a critique counts as a revision.
        let revision_count = if critique.is_empty() {
            state.revision_count
        } else {
            state.revision_count + 1
        };
        debug!(
            revision_count,
            words = payload.value.chapter.content.split_whitespace().count(),
            "chapter draft ready"
        );
        let result = payload.value;
        Ok(NodeUpdate::Draft(DraftUpdate {
            draft: result.chapter,
            metadata: result.metadata,
            next_steps: result.next_steps,
            revision_count,
            signal: payload.signal,
        }))
    }

    fn review(&self, state: &WorkflowState) -> Result<NodeUpdate> {
        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| anyhow!("review requires a chapter plan"))?;
        let content = state
            .draft
            .as_ref()
            .map(|draft| draft.content.as_str())
            .ok_or_else(|| anyhow!("review requires a chapter draft"))?;
        let payload = self.provider.review_chapter(&ReviewRequest {
            chapter: chapter_request(state)?,
            plan,
            chapter_content: content,
        })?;
        let report = self
            .guardrails
            .evaluate(state.project.chapter_length(), content);
        let review = Review::merge(payload.value, report, self.pass_score);
        debug!(
            score = review.score,
            should_revise = review.should_revise,
            guardrail_fail = review.guardrail_fail,
            effective_should_revise = review.effective_should_revise,
            "chapter reviewed"
        );
        Ok(NodeUpdate::Review {
            review,
            signal: payload.signal,
        })
    }

    fn persist(&self, state: &WorkflowState) -> Result<NodeUpdate> {
        let context = context(state)?;
        let draft = state
            .draft
            .as_ref()
            .ok_or_else(|| anyhow!("persist requires a chapter draft"))?;
        let mut metadata = state.chapter_metadata.clone();
        if let Some(review) = &state.review {
            metadata.insert("review".to_string(), serde_json::to_value(review)?);
        }

        let mut project = state.project.clone();
        let persisted = persist_chapter(
            self.store,
            &mut project,
            PersistRequest {
                outline: &context.outline,
                target: &context.target,
                draft,
                metadata,
                next_steps: state.next_steps.clone(),
            },
        )?;
        let output = ChapterOutput {
            persisted,
            fallback_stages: state.fallback_stages.clone(),
            used_fallback: state.fallback_stages.used_fallback(),
            progress: Default::default(),
            timings_ms: Default::default(),
        };
        Ok(NodeUpdate::Persist {
            output: Box::new(output),
            project: Box::new(project),
        })
    }
}

fn context(state: &WorkflowState) -> Result<&ChapterContext> {
    state
        .context
        .as_ref()
        .ok_or_else(|| anyhow!("chapter context has not been retrieved"))
}

fn chapter_request(state: &WorkflowState) -> Result<ChapterRequest<'_>> {
    let context = context(state)?;
    Ok(ChapterRequest {
        project: &state.project,
        outline: &context.outline,
        chapter_number: context.chapter_number,
        memory: &context.memory_snippets,
        knowledge: &context.knowledge_snippets,
    })
}

/// Completion record for a node: the revision count it leaves behind and
/// its diagnostic meta.
fn node_end(update: &NodeUpdate, state: &WorkflowState) -> NodeEnd {
    let (revision_count, meta) = match update {
        NodeUpdate::Context(_) => (state.revision_count, None),
        NodeUpdate::Plan { signal, .. } => (
            state.revision_count,
            Some(json!({"used_fallback": signal.used_fallback})),
        ),
        NodeUpdate::Draft(draft) => (
            draft.revision_count,
            Some(json!({"used_fallback": draft.signal.used_fallback})),
        ),
        NodeUpdate::Review { review, signal } => (
            state.revision_count,
            Some(json!({
                "score": review.score,
                "effective_should_revise": review.effective_should_revise,
                "used_fallback": signal.used_fallback,
            })),
        ),
        NodeUpdate::Persist { .. } => (
            state.revision_count,
            Some(json!({"revision_count": state.revision_count})),
        ),
    };
    NodeEnd {
        revision_count,
        meta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fallback::FallbackStages;
    use crate::core::state::TelemetrySnapshot;
    use crate::test_support::{
        MemoryStore, RecordingSink, ScriptedProvider, outline_with_chapters, passing_review,
        project, revising_review,
    };
    use serde_json::Map;

    fn state_for(chapter_number: i64) -> WorkflowState {
        let mut project = project();
        project.outline = Some(outline_with_chapters(2));
        let mut inputs = Map::new();
        inputs.insert("chapter_number".to_string(), json!(chapter_number));
        WorkflowState::for_chapter(
            "run-1",
            "trace-1",
            project,
            inputs,
            TelemetrySnapshot::default(),
            FallbackStages::new(),
        )
    }

    fn reviewed(state: &mut WorkflowState, effective_should_revise: bool, revision_count: u32) {
        state.review = Some(Review {
            effective_should_revise,
            ..Review::default()
        });
        state.revision_count = revision_count;
    }

    #[test]
    fn review_loops_back_only_within_budget() {
        let mut state = state_for(1);
        reviewed(&mut state, true, 0);
        assert_eq!(ChapterNode::Review.next(&state), Some(ChapterNode::Draft));
        reviewed(&mut state, true, 2);
        assert_eq!(ChapterNode::Review.next(&state), Some(ChapterNode::Persist));
        reviewed(&mut state, false, 0);
        assert_eq!(ChapterNode::Review.next(&state), Some(ChapterNode::Persist));
        assert_eq!(ChapterNode::Persist.next(&state), None);
    }

    #[test]
    fn passing_review_persists_after_one_cycle() {
        let provider = ScriptedProvider::with_reviews(vec![passing_review()]);
        let store = MemoryStore::default();
        let sink = RecordingSink::default();
        let tracker = ProgressTracker::new("run-1", &sink);
        let subgraph = ChapterSubgraph::new(&provider, &store, &tracker, &EngineConfig::default());

        let mut state = state_for(1);
        subgraph.run(&mut state).expect("run");

        assert_eq!(provider.calls().draft, 1);
        assert_eq!(state.revision_count, 0);
        let progress = &state.telemetry.progress;
        assert_eq!(
            progress.completed_nodes,
            vec![
                "chapter_retrieve_context",
                "chapter_plan",
                "chapter_draft",
                "chapter_review",
                "chapter_persist"
            ]
        );
        assert_eq!(progress.node_meta["chapter_persist"], json!({"revision_count": 0}));
        assert_eq!(state.telemetry.node_timings.len(), 5);
        let output = state.output.expect("output");
        assert_eq!(output.persisted.metadata["review"]["score"], json!(92));
        assert!(!output.used_fallback);
    }

    #[test]
    fn revisions_pass_previous_critique_and_draft() {
        let provider =
            ScriptedProvider::with_reviews(vec![revising_review("Add an example."), passing_review()]);
        let store = MemoryStore::default();
        let sink = RecordingSink::default();
        let tracker = ProgressTracker::new("run-1", &sink);
        let subgraph = ChapterSubgraph::new(&provider, &store, &tracker, &EngineConfig::default());

        let mut state = state_for(1);
        subgraph.run(&mut state).expect("run");

        let critiques = provider.critiques();
        assert_eq!(critiques, vec!["".to_string(), "Add an example.".to_string()]);
        let previous = provider.previous_drafts();
        assert!(previous[0].is_empty());
        assert!(previous[1].starts_with("# Chapter 1"));
        assert_eq!(state.revision_count, 1);
        assert_eq!(
            state.telemetry.progress.node_meta["chapter_review"]["effective_should_revise"],
            json!(false)
        );
    }

    #[test]
    fn failed_node_is_recorded_and_aborts() {
        let provider = ScriptedProvider::default().failing_review("provider exploded");
        let store = MemoryStore::default();
        let sink = RecordingSink::default();
        let tracker = ProgressTracker::new("run-1", &sink);
        let subgraph = ChapterSubgraph::new(&provider, &store, &tracker, &EngineConfig::default());

        let mut state = state_for(1);
        let err = subgraph.run(&mut state).unwrap_err();
        assert!(err.to_string().contains("provider exploded"));
        let progress = &state.telemetry.progress;
        assert_eq!(progress.current_node, "chapter_review");
        assert_eq!(progress.last_error.as_deref(), Some("provider exploded"));
        assert!(state.output.is_none());
        assert!(store.list_chapters("p1").expect("list").is_empty());
        assert_eq!(provider.calls().review, 1);
    }
}
