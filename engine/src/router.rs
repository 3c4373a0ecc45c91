//! Mode router: validates the mode, dispatches to the chapter subgraph or a
//! single-shot handler, and attaches progress and timings to the output.

use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use tracing::{info, instrument};

use crate::chapter::ChapterSubgraph;
use crate::core::fallback::{FallbackSignal, FallbackStages};
use crate::core::outline::normalize_outline;
use crate::core::state::{TelemetrySnapshot, WorkflowState};
use crate::core::types::{Project, RunMode, TimingsSummary};
use crate::error::EngineError;
use crate::io::config::EngineConfig;
use crate::io::store::BookStore;
use crate::provider::{
    GenerationProvider, OutlineRequest, OutlineResult, ProfileRequest, RefineRequest,
};
use crate::telemetry::{NodeEnd, ProgressTracker, TelemetrySink, elapsed_ms};
use crate::workflow::{
    ExportFormat, apply_outline, apply_profile_updates, export_project, knowledge_snippets,
    to_strings,
};

/// Conversation turns forwarded to the profile assistant.
const PROFILE_HISTORY_TURNS: usize = 20;

const TOC_NEXT_STEPS: [&str; 3] = [
    "Review the generated outline.",
    "Refine the outline with targeted feedback.",
    "Generate chapters one-by-one once approved.",
];

const REFINE_NEXT_STEPS: [&str; 2] = ["Review the refined outline.", "Generate the next chapter."];

/// Identifiers of the run being executed. An empty `run_id` disables
/// telemetry persistence.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunIds<'a> {
    pub run_id: &'a str,
    pub trace_id: &'a str,
}

pub struct Engine<'a> {
    provider: &'a dyn GenerationProvider,
    store: &'a dyn BookStore,
    config: &'a EngineConfig,
}

impl<'a> Engine<'a> {
    pub fn new(
        provider: &'a dyn GenerationProvider,
        store: &'a dyn BookStore,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Execute one run of `mode` against `project`.
    ///
    /// The mode is validated before anything else happens. The returned
    /// object is the handler's output plus `progress` and `timings_ms`.
    /// Errors are returned unchanged after telemetry has recorded them.
    #[instrument(skip_all, fields(run_id = ids.run_id, trace_id = ids.trace_id, mode = mode))]
    pub fn execute(
        &self,
        project: &mut Project,
        mode: &str,
        inputs: &Map<String, Value>,
        ids: RunIds<'_>,
        sink: &dyn TelemetrySink,
    ) -> Result<Map<String, Value>> {
        let mode: RunMode = mode.parse()?;
        let started = Instant::now();
        let tracker = ProgressTracker::new(ids.run_id, sink)
            .with_error_limit(self.config.telemetry.error_limit_chars);

        let (mut output, snapshot) = match mode {
            RunMode::Chapter => self.run_chapter(&tracker, project, inputs, ids)?,
            RunMode::Toc => self.single_shot(&tracker, mode, || self.run_toc(project))?,
            RunMode::RefineToc => {
                self.single_shot(&tracker, mode, || self.run_refine_toc(project, inputs))?
            }
            RunMode::Export => self.single_shot(&tracker, mode, || self.run_export(project, inputs))?,
            RunMode::ProfileAssistant => self.single_shot(&tracker, mode, || {
                self.run_profile_assistant(project, inputs)
            })?,
        };

        let timings = TimingsSummary {
            total_ms: elapsed_ms(started),
            nodes: snapshot.node_timings,
        };
        output.insert("progress".to_string(), serde_json::to_value(&snapshot.progress)?);
        output.insert("timings_ms".to_string(), serde_json::to_value(&timings)?);
        info!(%mode, total_ms = timings.total_ms, "run finished");
        Ok(output)
    }

    /// One node around one handler, with the standard envelope.
    fn single_shot(
        &self,
        tracker: &ProgressTracker<'_>,
        mode: RunMode,
        handler: impl FnOnce() -> Result<Map<String, Value>>,
    ) -> Result<(Map<String, Value>, TelemetrySnapshot)> {
        let mut snapshot = TelemetrySnapshot::default();
        let output = tracker.node(&mut snapshot, mode.node_name(), 0, handler, |_| {
            NodeEnd::default()
        })?;
        Ok((output, snapshot))
    }

    /// `run_chapter` wraps the subgraph. The subgraph writes into the same
    /// telemetry snapshot, so the run has a single progress trail.
    fn run_chapter(
        &self,
        tracker: &ProgressTracker<'_>,
        project: &mut Project,
        inputs: &Map<String, Value>,
        ids: RunIds<'_>,
    ) -> Result<(Map<String, Value>, TelemetrySnapshot)> {
        let node = RunMode::Chapter.node_name();
        let started = Instant::now();
        let snapshot = tracker.on_start(&TelemetrySnapshot::default(), node, 0);

        let mut state = WorkflowState::for_chapter(
            ids.run_id,
            ids.trace_id,
            project.clone(),
            inputs.clone(),
            snapshot,
            FallbackStages::new(),
        )
        .with_max_revisions(self.config.max_revisions);
        let outcome = ChapterSubgraph::new(self.provider, self.store, tracker, self.config)
            .run(&mut state)
            .and_then(|()| {
                state
                    .output
                    .take()
                    .ok_or_else(|| EngineError::EmptySubgraphOutput.into())
            });
        let output = match outcome {
            Ok(output) => output,
            Err(err) => {
                tracker.on_error(
                    &state.telemetry,
                    node,
                    Some(elapsed_ms(started)),
                    state.revision_count,
                    &err,
                );
                return Err(err);
            }
        };

        let snapshot = tracker.on_end(
            &state.telemetry,
            node,
            elapsed_ms(started),
            NodeEnd {
                revision_count: state.revision_count,
                meta: Some(json!({"revision_count": state.revision_count})),
            },
        );
        *project = state.project;
        match serde_json::to_value(&output).context("encode chapter output")? {
            Value::Object(output) => Ok((output, snapshot)),
            _ => bail!("chapter output did not encode as a JSON object"),
        }
    }

    fn knowledge(&self, project: &Project) -> Result<Vec<String>> {
        knowledge_snippets(self.store, &project.id, self.config.context.knowledge_limit)
    }

    fn run_toc(&self, project: &mut Project) -> Result<Map<String, Value>> {
        let knowledge = self.knowledge(project)?;
        let payload = self.provider.generate_outline(&OutlineRequest {
            project,
            knowledge: &knowledge,
        })?;
        self.apply_outline_payload(project, payload.value, &payload.signal, &TOC_NEXT_STEPS)
    }

    fn run_refine_toc(
        &self,
        project: &mut Project,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let feedback = inputs
            .get("feedback")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|feedback| !feedback.is_empty())
            .ok_or(EngineError::MissingInput("feedback"))?;
        let knowledge = self.knowledge(project)?;
        let payload = self.provider.refine_outline(&RefineRequest {
            project,
            existing_outline: project.outline.as_ref(),
            feedback,
            knowledge: &knowledge,
        })?;
        self.apply_outline_payload(project, payload.value, &payload.signal, &REFINE_NEXT_STEPS)
    }

    fn apply_outline_payload(
        &self,
        project: &mut Project,
        result: OutlineResult,
        signal: &FallbackSignal,
        default_next_steps: &[&str],
    ) -> Result<Map<String, Value>> {
        let outline = normalize_outline(&result.outline)?;
        apply_outline(self.store, project, &outline, &result.metadata)?;
        let stages = FallbackStages::new().merge(signal);
        let next_steps = if result.next_steps.is_empty() {
            to_strings(default_next_steps)
        } else {
            result.next_steps
        };

        let mut output = Map::new();
        output.insert("status".to_string(), json!("success"));
        output.insert("outline".to_string(), json!(outline));
        output.insert("metadata".to_string(), Value::Object(project.metadata.clone()));
        output.insert("next_steps".to_string(), json!(next_steps));
        output.insert("used_fallback".to_string(), json!(stages.used_fallback()));
        output.insert("fallback_stages".to_string(), json!(stages));
        Ok(output)
    }

    fn run_export(
        &self,
        project: &mut Project,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let format: ExportFormat = match inputs.get("export_format") {
            None | Some(Value::Null) => ExportFormat::Markdown,
            Some(Value::String(raw)) => raw.parse()?,
            Some(other) => other.to_string().parse()?,
        };
        export_project(self.store, project, format)
    }

    fn run_profile_assistant(
        &self,
        project: &mut Project,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let message = inputs
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        let current_profile = match inputs.get("current_profile") {
            Some(Value::Object(profile)) => profile.clone(),
            _ => Map::new(),
        };
        let conversation: &[Value] = match inputs.get("conversation") {
            Some(Value::Array(turns)) => {
                &turns[turns.len().saturating_sub(PROFILE_HISTORY_TURNS)..]
            }
            _ => &[],
        };

        let payload = self.provider.assist_profile(&ProfileRequest {
            project,
            current_profile: &current_profile,
            conversation,
            message,
        })?;
        let reply = payload.value;
        if reply.is_finalized && !reply.field_updates.is_empty() {
            apply_profile_updates(self.store, project, &reply.field_updates)?;
        }

        let stages = FallbackStages::new().merge(&payload.signal);
        let mut output = Map::new();
        output.insert("status".to_string(), json!("success"));
        output.insert(
            "assistant_response".to_string(),
            serde_json::to_value(&reply).context("encode assistant reply")?,
        );
        output.insert("used_fallback".to_string(), json!(stages.used_fallback()));
        output.insert("fallback_stages".to_string(), json!(stages));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProjectStatus;
    use crate::telemetry::NullSink;
    use crate::test_support::{MemoryStore, RecordingSink, ScriptedProvider, project};

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object inputs")
    }

    #[test]
    fn invalid_mode_fails_before_any_side_effect() {
        let provider = ScriptedProvider::default();
        let store = MemoryStore::default();
        let sink = RecordingSink::default();
        let config = EngineConfig::default();
        let engine = Engine::new(&provider, &store, &config);
        let mut project = project();

        let err = engine
            .execute(&mut project, "draft", &Map::new(), RunIds::default(), &sink)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidMode(_))
        ));
        assert!(sink.snapshots().is_empty());
        assert_eq!(provider.calls().total(), 0);
        assert!(store.load_project("p1").is_err());
    }

    #[test]
    fn toc_replaces_outline_and_syncs_chapters() {
        let provider = ScriptedProvider::default().outline_falls_back();
        let store = MemoryStore::default();
        let sink = RecordingSink::default();
        let config = EngineConfig::default();
        let engine = Engine::new(&provider, &store, &config);
        let mut project = project();
        project
            .metadata
            .insert("user_concept".to_string(), json!({"subtitle": "Original"}));
        let ids = RunIds {
            run_id: "run-1",
            trace_id: "trace-1",
        };

        let output = engine
            .execute(&mut project, "toc", &Map::new(), ids, &sink)
            .expect("toc");
        assert_eq!(
            output["metadata"]["user_concept"],
            json!({"subtitle": "Original"})
        );
        assert_eq!(
            output["metadata"]["llm_runtime"]["chapter_count"],
            json!(provider.outline_chapter_count())
        );
        assert_eq!(output["status"], json!("success"));
        assert_eq!(output["fallback_stages"], json!(["toc"]));
        assert_eq!(output["used_fallback"], json!(true));
        assert_eq!(
            output["next_steps"],
            json!(crate::provider::fallback::outline(&project).next_steps)
        );
        assert_eq!(output["progress"]["completed_nodes"], json!(["run_toc"]));
        assert!(output["timings_ms"]["nodes"]["run_toc_ms"].is_u64());
        assert_eq!(project.status, ProjectStatus::Outlined);
        assert_eq!(
            store.list_chapters("p1").expect("list").len(),
            provider.outline_chapter_count() as usize
        );
        assert_eq!(sink.snapshots().len(), 2);
    }

    #[test]
    fn generated_outline_uses_default_next_steps() {
        let provider = ScriptedProvider::default();
        let store = MemoryStore::default();
        let config = EngineConfig::default();
        let engine = Engine::new(&provider, &store, &config);
        let mut project = project();

        let output = engine
            .execute(&mut project, "toc", &Map::new(), RunIds::default(), &NullSink)
            .expect("toc");
        assert_eq!(output["next_steps"], json!(TOC_NEXT_STEPS));
        assert_eq!(output["used_fallback"], json!(false));

        let output = engine
            .execute(
                &mut project,
                "refine_toc",
                &inputs(json!({"feedback": "Shorter chapters"})),
                RunIds::default(),
                &NullSink,
            )
            .expect("refine");
        assert_eq!(output["next_steps"], json!(REFINE_NEXT_STEPS));
        assert_eq!(output["outline"]["synopsis"], json!("Refined: Shorter chapters"));
        assert_eq!(provider.calls().refine, 1);
        assert_eq!(store.list_chapters("p1").expect("list").len(), 4);
    }

    #[test]
    fn refine_requires_feedback() {
        let provider = ScriptedProvider::default();
        let store = MemoryStore::default();
        let sink = RecordingSink::default();
        let config = EngineConfig::default();
        let engine = Engine::new(&provider, &store, &config);
        let mut project = project();
        let ids = RunIds {
            run_id: "run-1",
            trace_id: "",
        };

        let err = engine
            .execute(
                &mut project,
                "refine_toc",
                &inputs(json!({"feedback": "   "})),
                ids,
                &sink,
            )
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<EngineError>(),
            Some(&EngineError::MissingInput("feedback"))
        );
        assert_eq!(provider.calls().refine, 0);
        let last = sink.snapshots().pop().expect("snapshot");
        assert_eq!(
            last.progress.last_error.as_deref(),
            Some("feedback is required")
        );
    }

    #[test]
    fn profile_assistant_applies_finalized_updates() {
        let provider = ScriptedProvider::default().finalizing_profile(json!({
            "title": "Kitchen Science",
            "length": 45000,
        }));
        let store = MemoryStore::default();
        let config = EngineConfig::default();
        let engine = Engine::new(&provider, &store, &config);
        let mut project = project();
        let turns: Vec<Value> = (0..30)
            .map(|i| json!({"role": "user", "content": format!("turn {i}")}))
            .collect();

        let output = engine
            .execute(
                &mut project,
                "profile_assistant",
                &inputs(json!({"message": "finalize", "conversation": turns})),
                RunIds::default(),
                &NullSink,
            )
            .expect("profile");
        assert_eq!(output["assistant_response"]["is_finalized"], json!(true));
        assert_eq!(output["fallback_stages"], json!([]));
        assert_eq!(project.title, "Kitchen Science");
        assert_eq!(project.target_word_count, 45_000);
        assert_eq!(provider.last_conversation_len(), PROFILE_HISTORY_TURNS);
    }

    #[test]
    fn export_rejects_unknown_format() {
        let provider = ScriptedProvider::default();
        let store = MemoryStore::default();
        let config = EngineConfig::default();
        let engine = Engine::new(&provider, &store, &config);
        let mut project = project();

        let err = engine
            .execute(
                &mut project,
                "export",
                &inputs(json!({"export_format": "pdf"})),
                RunIds::default(),
                &NullSink,
            )
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<EngineError>(),
            Some(&EngineError::UnsupportedExportFormat("pdf".to_string()))
        );
    }
}
