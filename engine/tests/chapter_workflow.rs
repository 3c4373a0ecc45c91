//! End-to-end chapter runs through the mode router.
//!
//! These tests drive `Engine::execute` with the scripted provider and the
//! in-memory store to verify the revision loop bound, guardrail-driven
//! revisions, fallback aggregation, input validation, and persistence.

use engine::core::review::{ModelReview, SYNTHESIZED_CRITIQUE};
use engine::core::types::{ChapterStatus, NodeStatus, Project, ProjectStatus, RunRecord};
use engine::error::EngineError;
use engine::io::config::EngineConfig;
use engine::io::store::{BookStore, RunStore, RunTelemetrySink};
use engine::router::{Engine, RunIds};
use engine::telemetry::NullSink;
use engine::test_support::{
    MemoryStore, RecordingSink, ScriptedProvider, outline_with_chapters, passing_review, project,
    revising_review,
};
use serde_json::{Map, Value, json};

const IDS: RunIds<'static> = RunIds {
    run_id: "run-1",
    trace_id: "trace-1",
};

fn outlined_project() -> Project {
    let mut project = project();
    project.outline = Some(outline_with_chapters(2));
    project
}

fn chapter_input(number: Value) -> Map<String, Value> {
    let mut input = Map::new();
    input.insert("chapter_number".to_string(), number);
    input
}

fn run_chapter(
    provider: &ScriptedProvider,
    store: &MemoryStore,
    sink: &RecordingSink,
    project: &mut Project,
    number: Value,
) -> anyhow::Result<Map<String, Value>> {
    let config = EngineConfig::default();
    let engine = Engine::new(provider, store, &config);
    engine.execute(project, "chapter", &chapter_input(number), IDS, sink)
}

/// A review that always asks for changes stops after `max_revisions`.
///
/// Expected cycle: 3 drafts, 3 reviews, 1 persist, `revision_count == 2`.
#[test]
fn endless_revision_requests_stop_at_the_budget() {
    let provider = ScriptedProvider::with_reviews(vec![revising_review("Go deeper.")]);
    let store = MemoryStore::default();
    let sink = RecordingSink::default();
    let mut project = outlined_project();

    let output = run_chapter(&provider, &store, &sink, &mut project, json!(1)).expect("chapter");

    assert_eq!(provider.calls().draft, 3);
    assert_eq!(provider.calls().review, 3);
    assert_eq!(provider.calls().plan, 1);
    assert_eq!(store.list_chapters("p1").expect("list").len(), 1);
    assert_eq!(output["progress"]["revision_count"], json!(2));
    assert_eq!(
        output["progress"]["node_meta"]["chapter_persist"],
        json!({"revision_count": 2})
    );
    assert_eq!(
        output["progress"]["node_meta"]["run_chapter"],
        json!({"revision_count": 2})
    );
    assert_eq!(output["progress"]["current_node"], json!("run_chapter"));
    assert_eq!(
        provider.critiques(),
        vec!["".to_string(), "Go deeper.".to_string(), "Go deeper.".to_string()]
    );
}

/// The model's own `should_revise` wins even with a high score.
#[test]
fn should_revise_flag_triggers_revision_at_high_score() {
    let eager = ModelReview {
        score: 95,
        should_revise: true,
        critique: "Tighten the opening.".to_string(),
        ..ModelReview::default()
    };
    let provider = ScriptedProvider::with_reviews(vec![eager, passing_review()]);
    let store = MemoryStore::default();
    let sink = RecordingSink::default();
    let mut project = outlined_project();

    let output = run_chapter(&provider, &store, &sink, &mut project, json!(1)).expect("chapter");

    assert_eq!(provider.calls().draft, 2);
    assert_eq!(output["progress"]["revision_count"], json!(1));
    assert_eq!(output["metadata"]["review"]["score"], json!(92));
}

/// Thin drafts fail the guardrails even when the model is satisfied.
#[test]
fn guardrail_failure_alone_forces_revisions() {
    let provider = ScriptedProvider::with_reviews(vec![passing_review()]).thin_drafts();
    let store = MemoryStore::default();
    let sink = RecordingSink::default();
    let mut project = outlined_project();

    let output = run_chapter(&provider, &store, &sink, &mut project, json!(1)).expect("chapter");

    assert_eq!(provider.calls().draft, 3);
    assert_eq!(provider.calls().review, 3);
    assert_eq!(output["progress"]["revision_count"], json!(2));
    assert_eq!(provider.critiques()[1], SYNTHESIZED_CRITIQUE);
    let review = &output["metadata"]["review"];
    assert_eq!(review["score"], json!(92));
    assert_eq!(review["should_revise"], json!(false));
    assert_eq!(review["guardrail_fail"], json!(true));
    assert_eq!(review["effective_should_revise"], json!(true));
    assert_eq!(
        output["progress"]["node_meta"]["chapter_review"]["effective_should_revise"],
        json!(true)
    );
    // Persisted anyway once the budget is spent.
    assert_eq!(output["status"], json!("success"));
}

#[test]
fn fallback_stages_are_aggregated_in_order() {
    let provider = ScriptedProvider::default()
        .review_falls_back()
        .plan_falls_back();
    let store = MemoryStore::default();
    let sink = RecordingSink::default();
    let mut project = outlined_project();

    let output = run_chapter(&provider, &store, &sink, &mut project, json!("1")).expect("chapter");

    assert_eq!(
        output["fallback_stages"],
        json!(["chapter_plan", "chapter_review"])
    );
    assert_eq!(output["used_fallback"], json!(true));
    assert_eq!(
        output["progress"]["node_meta"]["chapter_plan"],
        json!({"used_fallback": true})
    );
    assert_eq!(
        output["progress"]["node_meta"]["chapter_draft"],
        json!({"used_fallback": false})
    );
}

#[test]
fn plan_and_draft_fallbacks_are_reported_without_review() {
    let provider = ScriptedProvider::with_reviews(vec![passing_review()])
        .draft_falls_back()
        .plan_falls_back();
    let store = MemoryStore::default();
    let sink = RecordingSink::default();
    let mut project = outlined_project();

    let output = run_chapter(&provider, &store, &sink, &mut project, json!(1)).expect("chapter");

    assert_eq!(
        output["fallback_stages"],
        json!(["chapter_plan", "chapter_draft"])
    );
    assert_eq!(output["used_fallback"], json!(true));
    assert_eq!(
        output["progress"]["node_meta"]["chapter_draft"],
        json!({"used_fallback": true})
    );
    assert_eq!(store.list_chapters("p1").expect("list").len(), 1);
}

/// Run store whose every read and write fails.
struct UnavailableRuns;

impl RunStore for UnavailableRuns {
    fn load_run(&self, _run_id: &str) -> anyhow::Result<Option<RunRecord>> {
        anyhow::bail!("run storage unavailable")
    }

    fn save_run(&self, _run: &RunRecord) -> anyhow::Result<()> {
        anyhow::bail!("run storage unavailable")
    }
}

/// Telemetry writes that fail are dropped; the chapter still completes.
#[test]
fn telemetry_persistence_failures_do_not_fail_the_run() {
    let provider = ScriptedProvider::with_reviews(vec![passing_review()]);
    let store = MemoryStore::default();
    let runs = UnavailableRuns;
    let sink = RunTelemetrySink::new(&runs);
    let config = EngineConfig::default();
    let mut project = outlined_project();

    let output = Engine::new(&provider, &store, &config)
        .execute(&mut project, "chapter", &chapter_input(json!(1)), IDS, &sink)
        .expect("chapter");

    assert_eq!(output["status"], json!("success"));
    assert_eq!(output["progress"]["node_status"]["run_chapter"], json!("completed"));
    assert_eq!(store.list_chapters("p1").expect("list").len(), 1);
}

#[test]
fn out_of_range_chapter_fails_before_any_generation() {
    let provider = ScriptedProvider::default();
    let store = MemoryStore::default();
    let sink = RecordingSink::default();
    let mut project = outlined_project();

    let err = run_chapter(&provider, &store, &sink, &mut project, json!(5)).unwrap_err();

    assert_eq!(
        err.downcast_ref::<EngineError>(),
        Some(&EngineError::ChapterOutOfRange {
            requested: 5,
            chapter_count: 2
        })
    );
    assert_eq!(provider.calls().total(), 0);
    let last = sink.snapshots().pop().expect("snapshot");
    assert_eq!(
        last.progress.node_status["chapter_retrieve_context"],
        NodeStatus::Failed
    );
    assert_eq!(last.progress.node_status["run_chapter"], NodeStatus::Failed);
}

#[test]
fn chapter_number_must_be_numeric() {
    let provider = ScriptedProvider::default();
    let store = MemoryStore::default();
    let sink = RecordingSink::default();
    let mut project = outlined_project();

    let err = run_chapter(&provider, &store, &sink, &mut project, json!("two")).unwrap_err();
    assert_eq!(
        err.downcast_ref::<EngineError>(),
        Some(&EngineError::InvalidInteger("chapter_number"))
    );
    let last = sink.snapshots().pop().expect("snapshot");
    assert_eq!(
        last.progress.node_status["chapter_retrieve_context"],
        NodeStatus::Failed
    );
    assert_eq!(last.progress.node_status["run_chapter"], NodeStatus::Failed);
    assert!(!last.progress.node_status.contains_key("chapter_plan"));

    let err = run_chapter(&provider, &store, &sink, &mut project, Value::Null).unwrap_err();
    assert_eq!(
        err.downcast_ref::<EngineError>(),
        Some(&EngineError::MissingInput("chapter_number"))
    );
    assert_eq!(provider.calls().total(), 0);
}

#[test]
fn missing_outline_is_an_input_error() {
    let provider = ScriptedProvider::default();
    let store = MemoryStore::default();
    let sink = RecordingSink::default();
    let mut project = project();

    let err = run_chapter(&provider, &store, &sink, &mut project, json!(1)).unwrap_err();
    assert_eq!(
        err.downcast_ref::<EngineError>(),
        Some(&EngineError::MissingOutline)
    );
}

/// Running the same chapter twice overwrites the stored chapter.
#[test]
fn rerunning_a_chapter_is_idempotent() {
    let provider = ScriptedProvider::default();
    let store = MemoryStore::default();
    let mut project = outlined_project();

    for _ in 0..2 {
        let config = EngineConfig::default();
        Engine::new(&provider, &store, &config)
            .execute(
                &mut project,
                "chapter",
                &chapter_input(json!(2.0)),
                RunIds::default(),
                &NullSink,
            )
            .expect("chapter");
    }

    let chapters = store.list_chapters("p1").expect("list");
    assert_eq!(chapters.len(), 1);
    assert_eq!(chapters[0].number, 2);
    assert_eq!(chapters[0].title, "Chapter 2: Idea 2");
    assert_eq!(chapters[0].status, ChapterStatus::Generated);
    assert_eq!(project.status, ProjectStatus::Writing);
}

/// Later chapters see earlier summaries; a full book exports.
#[test]
fn outline_then_chapters_then_export() {
    let provider = ScriptedProvider::default();
    let store = MemoryStore::default();
    let config = EngineConfig::default();
    let engine = Engine::new(&provider, &store, &config);
    let mut project = project();

    engine
        .execute(&mut project, "toc", &Map::new(), RunIds::default(), &NullSink)
        .expect("toc");
    for number in 1..=3 {
        engine
            .execute(
                &mut project,
                "chapter",
                &chapter_input(json!(number)),
                RunIds::default(),
                &NullSink,
            )
            .expect("chapter");
    }
    let mut input = Map::new();
    input.insert("export_format".to_string(), json!("both"));
    let output = engine
        .execute(&mut project, "export", &input, RunIds::default(), &NullSink)
        .expect("export");

    assert_eq!(output["markdown_filename"], json!("Test_Book.md"));
    assert_eq!(output["used_fallback"], json!(false));
    assert_eq!(project.status, ProjectStatus::Exported);
    let markdown = store
        .export_contents("p1", "Test_Book.md")
        .expect("markdown export");
    assert!(markdown.contains("# Chapter 3: Idea 3"));
    assert!(store.export_contents("p1", "Test_Book.json").is_some());
}
