//! Test-only helpers: deterministic fixtures, an in-memory store, a
//! recording telemetry sink, and a scripted generation provider.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use serde_json::{Map, Value, json};

use crate::core::review::ModelReview;
use crate::core::state::TelemetrySnapshot;
use crate::core::types::{
    ChapterDraft, Outline, OutlineChapter, Project, RunRecord, RunStatus, StoredChapter, summarize,
};
use crate::io::store::{BookStore, KnowledgeDocument, RunStore};
use crate::provider::{
    ChapterRequest, DraftRequest, DraftResult, GenerationProvider, OutlineRequest, OutlineResult,
    ProfileAssistantReply, ProfileRequest, RefineRequest, ReviewRequest, STAGE_DRAFT, STAGE_PLAN,
    STAGE_PROFILE_ASSISTANT, STAGE_REFINE_TOC, STAGE_REVIEW, STAGE_TOC, StagePayload, fallback,
};

/// Project `p1` with a filled-in brief and an empty profile.
pub fn project() -> Project {
    let mut project = Project::new("p1", "Test Book");
    project.genre = "Non-fiction".to_string();
    project.target_audience = "General readers".to_string();
    project.language = "English".to_string();
    project.tone = "Conversational".to_string();
    project
}

/// Outline with chapters `Chapter i: Idea i`, each with two bullet points.
pub fn outline_with_chapters(count: u32) -> Outline {
    Outline {
        synopsis: "A test book.".to_string(),
        chapters: (1..=count)
            .map(|i| OutlineChapter {
                number: i,
                title: format!("Chapter {i}: Idea {i}"),
                bullet_points: vec![format!("Point {i}.1"), format!("Point {i}.2")],
            })
            .collect(),
    }
}

/// Queued run record with fixed timestamps.
pub fn run_record(id: &str, project_id: &str, mode: &str, input: Value) -> RunRecord {
    RunRecord {
        id: id.to_string(),
        trace_id: format!("trace-{id}"),
        project_id: project_id.to_string(),
        mode: mode.to_string(),
        input: match input {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        output: Map::new(),
        timings: Map::new(),
        status: RunStatus::Queued,
        error_message: None,
        created_at: "2024-01-01T00:00:00.000Z".to_string(),
        started_at: None,
        finished_at: None,
    }
}

/// Model review that passes (score 92, no revision requested).
pub fn passing_review() -> ModelReview {
    ModelReview {
        score: 92,
        should_revise: false,
        ..ModelReview::default()
    }
}

/// Model review that asks for a revision with `critique`.
pub fn revising_review(critique: &str) -> ModelReview {
    ModelReview {
        score: 70,
        should_revise: true,
        issues: vec!["Needs more depth.".to_string()],
        critique: critique.to_string(),
        ..ModelReview::default()
    }
}

/// Chapter body of roughly 1300 words with one `##` heading.
pub fn long_chapter(title: &str) -> String {
    let paragraph = "The chapter develops its argument with a concrete example and a clear transition. "
        .repeat(10);
    let body = vec![paragraph.trim().to_string(); 10].join("\n\n");
    format!("# {title}\n\nAn opening that frames the idea.\n\n## Development\n\n{body}")
}

/// Telemetry sink that keeps every snapshot it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    snapshots: RefCell<Vec<TelemetrySnapshot>>,
}

impl RecordingSink {
    pub fn snapshots(&self) -> Vec<TelemetrySnapshot> {
        self.snapshots.borrow().clone()
    }
}

impl crate::telemetry::TelemetrySink for RecordingSink {
    fn persist(&self, _run_id: &str, snapshot: &TelemetrySnapshot) {
        self.snapshots.borrow_mut().push(snapshot.clone());
    }
}

/// In-memory [`BookStore`] and [`RunStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: RefCell<BTreeMap<String, Project>>,
    chapters: RefCell<BTreeMap<String, BTreeMap<u32, StoredChapter>>>,
    knowledge: RefCell<BTreeMap<String, Vec<KnowledgeDocument>>>,
    exports: RefCell<BTreeMap<(String, String), String>>,
    runs: RefCell<BTreeMap<String, RunRecord>>,
}

impl MemoryStore {
    pub fn add_knowledge(&self, project_id: &str, name: &str, text: &str) {
        self.knowledge
            .borrow_mut()
            .entry(project_id.to_string())
            .or_default()
            .push(KnowledgeDocument {
                name: name.to_string(),
                text: text.to_string(),
            });
    }

    pub fn export_contents(&self, project_id: &str, file_name: &str) -> Option<String> {
        self.exports
            .borrow()
            .get(&(project_id.to_string(), file_name.to_string()))
            .cloned()
    }
}

impl BookStore for MemoryStore {
    fn load_project(&self, project_id: &str) -> Result<Project> {
        match self.projects.borrow().get(project_id) {
            Some(project) => Ok(project.clone()),
            None => bail!("project '{project_id}' not found"),
        }
    }

    fn save_project(&self, project: &Project) -> Result<()> {
        self.projects
            .borrow_mut()
            .insert(project.id.clone(), project.clone());
        Ok(())
    }

    fn list_chapters(&self, project_id: &str) -> Result<Vec<StoredChapter>> {
        Ok(self
            .chapters
            .borrow()
            .get(project_id)
            .map(|chapters| chapters.values().cloned().collect())
            .unwrap_or_default())
    }

    fn load_chapter(&self, project_id: &str, number: u32) -> Result<Option<StoredChapter>> {
        Ok(self
            .chapters
            .borrow()
            .get(project_id)
            .and_then(|chapters| chapters.get(&number).cloned()))
    }

    fn save_chapter(&self, project_id: &str, chapter: &StoredChapter) -> Result<()> {
        self.chapters
            .borrow_mut()
            .entry(project_id.to_string())
            .or_default()
            .insert(chapter.number, chapter.clone());
        Ok(())
    }

    fn knowledge_documents(&self, project_id: &str) -> Result<Vec<KnowledgeDocument>> {
        let mut docs = self
            .knowledge
            .borrow()
            .get(project_id)
            .cloned()
            .unwrap_or_default();
        docs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(docs)
    }

    fn write_export(&self, project_id: &str, file_name: &str, contents: &str) -> Result<String> {
        self.exports.borrow_mut().insert(
            (project_id.to_string(), file_name.to_string()),
            contents.to_string(),
        );
        Ok(format!("memory://{project_id}/exports/{file_name}"))
    }
}

impl RunStore for MemoryStore {
    fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.runs.borrow().get(run_id).cloned())
    }

    fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.runs.borrow_mut().insert(run.id.clone(), run.clone());
        Ok(())
    }
}

/// Number of calls per provider operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCalls {
    pub plan: usize,
    pub draft: usize,
    pub review: usize,
    pub outline: usize,
    pub refine: usize,
    pub profile: usize,
}

impl ProviderCalls {
    pub fn total(&self) -> usize {
        self.plan + self.draft + self.review + self.outline + self.refine + self.profile
    }
}

/// Generation provider with scripted answers and call recording.
///
/// By default every stage succeeds without fallback: drafts are long enough
/// to clear the guardrails and every review passes. Builders switch stages
/// to their deterministic fallbacks or script the review sequence.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    reviews: Vec<ModelReview>,
    review_error: Option<String>,
    plan_fallback: bool,
    draft_fallback: bool,
    review_fallback: bool,
    outline_fallback: bool,
    thin_drafts: bool,
    profile_updates: Option<Map<String, Value>>,
    calls: Cell<ProviderCalls>,
    critiques: RefCell<Vec<String>>,
    previous_drafts: RefCell<Vec<String>>,
    outline_chapter_count: Cell<u32>,
    last_conversation_len: Cell<usize>,
}

impl ScriptedProvider {
    /// Reviews returned in order; the last one repeats.
    pub fn with_reviews(reviews: Vec<ModelReview>) -> Self {
        Self {
            reviews,
            ..Self::default()
        }
    }

    pub fn failing_review(mut self, message: &str) -> Self {
        self.review_error = Some(message.to_string());
        self
    }

    pub fn plan_falls_back(mut self) -> Self {
        self.plan_fallback = true;
        self
    }

    pub fn draft_falls_back(mut self) -> Self {
        self.draft_fallback = true;
        self
    }

    pub fn review_falls_back(mut self) -> Self {
        self.review_fallback = true;
        self
    }

    pub fn outline_falls_back(mut self) -> Self {
        self.outline_fallback = true;
        self
    }

    /// Drafts too short for the guardrails and without a `##` heading.
    pub fn thin_drafts(mut self) -> Self {
        self.thin_drafts = true;
        self
    }

    /// Profile replies finalize with `updates` as field updates.
    pub fn finalizing_profile(mut self, updates: Value) -> Self {
        self.profile_updates = match updates {
            Value::Object(map) => Some(map),
            _ => Some(Map::new()),
        };
        self
    }

    pub fn calls(&self) -> ProviderCalls {
        self.calls.get()
    }

    /// Critique passed to each draft call, in order.
    pub fn critiques(&self) -> Vec<String> {
        self.critiques.borrow().clone()
    }

    /// Previous draft passed to each draft call, in order.
    pub fn previous_drafts(&self) -> Vec<String> {
        self.previous_drafts.borrow().clone()
    }

    /// Chapter count of the last outline produced.
    pub fn outline_chapter_count(&self) -> u32 {
        self.outline_chapter_count.get()
    }

    /// Conversation length seen by the last profile call.
    pub fn last_conversation_len(&self) -> usize {
        self.last_conversation_len.get()
    }

    fn record(&self, bump: impl FnOnce(&mut ProviderCalls)) {
        let mut calls = self.calls.get();
        bump(&mut calls);
        self.calls.set(calls);
    }

    fn outline_payload(
        &self,
        result: OutlineResult,
        fallback: bool,
        stage: &str,
    ) -> StagePayload<OutlineResult> {
        let count = result
            .outline
            .get("chapters")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        self.outline_chapter_count
            .set(u32::try_from(count).unwrap_or(u32::MAX));
        if fallback {
            StagePayload::fallback(result, stage)
        } else {
            StagePayload::generated(result)
        }
    }
}

impl GenerationProvider for ScriptedProvider {
    fn plan_chapter(
        &self,
        request: &ChapterRequest<'_>,
    ) -> Result<StagePayload<crate::core::types::ChapterPlan>> {
        self.record(|calls| calls.plan += 1);
        let plan = fallback::plan(request);
        if self.plan_fallback {
            return Ok(StagePayload::fallback(plan, STAGE_PLAN));
        }
        Ok(StagePayload::generated(plan))
    }

    fn draft_or_revise(&self, request: &DraftRequest<'_>) -> Result<StagePayload<DraftResult>> {
        self.record(|calls| calls.draft += 1);
        self.critiques.borrow_mut().push(request.critique.to_string());
        self.previous_drafts
            .borrow_mut()
            .push(request.previous_draft.to_string());
        if self.draft_fallback {
            return Ok(StagePayload::fallback(
                fallback::draft(&request.chapter),
                STAGE_DRAFT,
            ));
        }

        let title = request.chapter.chapter_title();
        let content = if self.thin_drafts {
            format!("# {title}\n\nToo short.")
        } else {
            long_chapter(&title)
        };
        let mut metadata = Map::new();
        metadata.insert("attempt".to_string(), json!(self.calls().draft));
        Ok(StagePayload::generated(DraftResult {
            chapter: ChapterDraft {
                number: request.chapter.chapter_number,
                summary: summarize(&content),
                title,
                content,
            },
            metadata,
            next_steps: Vec::new(),
        }))
    }

    fn review_chapter(&self, request: &ReviewRequest<'_>) -> Result<StagePayload<ModelReview>> {
        let index = self.calls().review;
        self.record(|calls| calls.review += 1);
        if let Some(message) = &self.review_error {
            return Err(anyhow!("{message}"));
        }
        if self.review_fallback {
            return Ok(StagePayload::fallback(
                fallback::review(request.chapter_content),
                STAGE_REVIEW,
            ));
        }
        let review = self
            .reviews
            .get(index)
            .or_else(|| self.reviews.last())
            .cloned()
            .unwrap_or_else(passing_review);
        Ok(StagePayload::generated(review))
    }

    fn generate_outline(
        &self,
        request: &OutlineRequest<'_>,
    ) -> Result<StagePayload<OutlineResult>> {
        self.record(|calls| calls.outline += 1);
        let result = if self.outline_fallback {
            fallback::outline(request.project)
        } else {
            OutlineResult {
                outline: json!(outline_with_chapters(3)),
                metadata: Map::new(),
                next_steps: Vec::new(),
            }
        };
        Ok(self.outline_payload(result, self.outline_fallback, STAGE_TOC))
    }

    fn refine_outline(&self, request: &RefineRequest<'_>) -> Result<StagePayload<OutlineResult>> {
        self.record(|calls| calls.refine += 1);
        let result = if self.outline_fallback {
            fallback::refined_outline(request.project)
        } else {
            let mut outline = outline_with_chapters(4);
            outline.synopsis = format!("Refined: {}", request.feedback);
            OutlineResult {
                outline: json!(outline),
                metadata: Map::new(),
                next_steps: Vec::new(),
            }
        };
        Ok(self.outline_payload(result, self.outline_fallback, STAGE_REFINE_TOC))
    }

    fn assist_profile(
        &self,
        request: &ProfileRequest<'_>,
    ) -> Result<StagePayload<ProfileAssistantReply>> {
        self.record(|calls| calls.profile += 1);
        self.last_conversation_len.set(request.conversation.len());
        match &self.profile_updates {
            Some(updates) => Ok(StagePayload::generated(ProfileAssistantReply {
                assistant_reply: "Applied your brief.".to_string(),
                field_updates: updates.clone(),
                is_finalized: true,
                ..ProfileAssistantReply::default()
            })),
            None => Ok(StagePayload::fallback(
                fallback::profile_reply(request.current_profile, request.message),
                STAGE_PROFILE_ASSISTANT,
            )),
        }
    }
}
