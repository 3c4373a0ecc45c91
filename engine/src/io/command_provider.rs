//! [`GenerationProvider`] backed by an external command.
//!
//! Each stage renders a prompt, pipes it to the configured command on stdin,
//! and reads one JSON object from stdout. The object is validated against the
//! stage's bundled JSON Schema before it is deserialized. Unusable output is
//! retried with a repair note; when every attempt fails the stage degrades to
//! its deterministic fallback instead of failing the run.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::outline::normalize_outline;
use crate::core::review::ModelReview;
use crate::core::types::{ChapterPlan, summarize};
use crate::io::config::ProviderConfig;
use crate::io::process::run_with_stdin;
use crate::io::prompt::PromptEngine;
use crate::provider::{
    ChapterRequest, DraftRequest, DraftResult, GenerationProvider, OutlineRequest, OutlineResult,
    ProfileAssistantReply, ProfileRequest, RefineRequest, ReviewRequest, STAGE_DRAFT, STAGE_PLAN,
    STAGE_PROFILE_ASSISTANT, STAGE_REFINE_TOC, STAGE_REVIEW, STAGE_TOC, StagePayload, fallback,
};

const PLAN_SCHEMA: &str = include_str!("schemas/plan.json");
const DRAFT_SCHEMA: &str = include_str!("schemas/draft.json");
const REVIEW_SCHEMA: &str = include_str!("schemas/review.json");
const OUTLINE_SCHEMA: &str = include_str!("schemas/outline.json");
const PROFILE_SCHEMA: &str = include_str!("schemas/profile_assistant.json");

const REPAIR_NOTE: &str = "Your previous response was not valid JSON for the required schema. \
Return only the corrected JSON object, with no commentary or code fences.";

pub struct CommandProvider {
    settings: ProviderConfig,
    prompts: PromptEngine,
}

impl CommandProvider {
    pub fn new(settings: ProviderConfig) -> Self {
        let prompts = PromptEngine::new(settings.prompt_budget_bytes);
        Self { settings, prompts }
    }

    /// No command configured: every stage uses its fallback.
    pub fn is_offline(&self) -> bool {
        self.settings.command.is_empty()
    }

    /// Run one stage; `None` means the caller should fall back.
    #[instrument(skip_all, fields(stage = stage))]
    fn generate<T>(
        &self,
        stage: &str,
        schema: &str,
        render: impl FnOnce(&PromptEngine) -> Result<String>,
        extract: impl Fn(Value) -> Result<T>,
    ) -> Option<T> {
        if self.is_offline() {
            debug!(stage, "no provider command configured");
            return None;
        }
        let prompt = match render(&self.prompts) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(stage, err = %format!("{err:#}"), "prompt rendering failed");
                return None;
            }
        };

        let attempts = self.settings.json_retries + 1;
        let mut input = prompt.clone();
        for attempt in 1..=attempts {
            match self.invoke(&input, schema).and_then(&extract) {
                Ok(value) => {
                    info!(stage, attempt, "provider stage generated");
                    return Some(value);
                }
                Err(err) => {
                    warn!(stage, attempt, attempts, err = %format!("{err:#}"), "provider output unusable");
                    input = format!("{prompt}\n\n{REPAIR_NOTE}");
                }
            }
        }
        None
    }

    fn invoke(&self, prompt: &str, schema: &str) -> Result<Value> {
        let output = run_with_stdin(
            &self.settings.command,
            prompt.as_bytes(),
            Duration::from_secs(self.settings.timeout_secs),
            self.settings.output_limit_bytes,
        )
        .context("run provider command")?;
        if output.timed_out {
            bail!("provider timed out after {}s", self.settings.timeout_secs);
        }
        if !output.status.success() {
            bail!(
                "provider exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            );
        }
        let value = parse_json_object(&output.stdout_text())?;
        validate_schema(&value, schema)?;
        Ok(value)
    }
}

impl GenerationProvider for CommandProvider {
    fn plan_chapter(&self, request: &ChapterRequest<'_>) -> Result<StagePayload<ChapterPlan>> {
        let generated = self.generate(
            STAGE_PLAN,
            PLAN_SCHEMA,
            |prompts| prompts.render_plan(request),
            |value| {
                let mut plan: ChapterPlan = take_field(value, "plan")?;
                plan.chapter_number = request.chapter_number;
                if plan.chapter_title.trim().is_empty() {
                    plan.chapter_title = request.chapter_title();
                }
                Ok(plan)
            },
        );
        Ok(match generated {
            Some(plan) => StagePayload::generated(plan),
            None => StagePayload::fallback(fallback::plan(request), STAGE_PLAN),
        })
    }

    fn draft_or_revise(&self, request: &DraftRequest<'_>) -> Result<StagePayload<DraftResult>> {
        let chapter = &request.chapter;
        let generated = self.generate(
            STAGE_DRAFT,
            DRAFT_SCHEMA,
            |prompts| prompts.render_draft(request),
            |value| {
                let mut result: DraftResult = decode(value)?;
                let draft = &mut result.chapter;
                if draft.content.trim().is_empty() {
                    bail!("chapter.content is empty");
                }
                draft.number = chapter.chapter_number;
                if draft.title.trim().is_empty() {
                    draft.title = chapter.chapter_title();
                }
                if draft.summary.trim().is_empty() {
                    draft.summary = summarize(&draft.content);
                }
                Ok(result)
            },
        );
        Ok(match generated {
            Some(result) => StagePayload::generated(result),
            None => StagePayload::fallback(fallback::draft(chapter), STAGE_DRAFT),
        })
    }

    fn review_chapter(&self, request: &ReviewRequest<'_>) -> Result<StagePayload<ModelReview>> {
        let generated = self.generate(
            STAGE_REVIEW,
            REVIEW_SCHEMA,
            |prompts| prompts.render_review(request),
            |value| take_field(value, "review"),
        );
        Ok(match generated {
            Some(review) => StagePayload::generated(review),
            None => StagePayload::fallback(
                fallback::review(request.chapter_content),
                STAGE_REVIEW,
            ),
        })
    }

    fn generate_outline(
        &self,
        request: &OutlineRequest<'_>,
    ) -> Result<StagePayload<OutlineResult>> {
        let generated = self.generate(
            STAGE_TOC,
            OUTLINE_SCHEMA,
            |prompts| prompts.render_outline(request),
            decode_outline,
        );
        Ok(match generated {
            Some(result) => StagePayload::generated(result),
            None => StagePayload::fallback(fallback::outline(request.project), STAGE_TOC),
        })
    }

    fn refine_outline(&self, request: &RefineRequest<'_>) -> Result<StagePayload<OutlineResult>> {
        let generated = self.generate(
            STAGE_REFINE_TOC,
            OUTLINE_SCHEMA,
            |prompts| prompts.render_refine(request),
            decode_outline,
        );
        Ok(match generated {
            Some(result) => StagePayload::generated(result),
            None => StagePayload::fallback(
                fallback::refined_outline(request.project),
                STAGE_REFINE_TOC,
            ),
        })
    }

    fn assist_profile(
        &self,
        request: &ProfileRequest<'_>,
    ) -> Result<StagePayload<ProfileAssistantReply>> {
        let generated = self.generate(
            STAGE_PROFILE_ASSISTANT,
            PROFILE_SCHEMA,
            |prompts| prompts.render_profile(request),
            decode,
        );
        Ok(match generated {
            Some(reply) => StagePayload::generated(reply),
            None => StagePayload::fallback(
                fallback::profile_reply(request.current_profile, request.message),
                STAGE_PROFILE_ASSISTANT,
            ),
        })
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).context("decode provider output")
}

fn take_field<T: DeserializeOwned>(mut value: Value, field: &str) -> Result<T> {
    let inner = value
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| anyhow!("provider output missing `{field}`"))?;
    serde_json::from_value(inner).with_context(|| format!("decode provider `{field}`"))
}

/// Outlines that would not normalize count as unusable output.
fn decode_outline(value: Value) -> Result<OutlineResult> {
    let result: OutlineResult = decode(value)?;
    normalize_outline(&result.outline)?;
    Ok(result)
}

/// Parse stdout as a single JSON object, tolerating code fences and chatter
/// around the object.
fn parse_json_object(stdout: &str) -> Result<Value> {
    let text = stdout.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(text);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        bail!("provider output contains no JSON object");
    };
    if end <= start {
        bail!("provider output contains no JSON object");
    }
    let value: Value =
        serde_json::from_str(&text[start..=end]).context("parse provider output as JSON")?;
    if !value.is_object() {
        bail!("provider output is not a JSON object");
    }
    Ok(value)
}

/// Validate against a bundled JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema).context("parse bundled schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{outline_with_chapters, project};
    use serde_json::json;

    fn chapter_request<'a>(
        project: &'a crate::core::types::Project,
        outline: &'a crate::core::types::Outline,
    ) -> ChapterRequest<'a> {
        ChapterRequest {
            project,
            outline,
            chapter_number: 1,
            memory: &[],
            knowledge: &[],
        }
    }

    #[test]
    fn offline_provider_falls_back_for_every_stage() {
        let provider = CommandProvider::new(ProviderConfig::default());
        assert!(provider.is_offline());
        let project = project();
        let outline = outline_with_chapters(1);
        let request = chapter_request(&project, &outline);

        let plan = provider.plan_chapter(&request).expect("plan");
        assert!(plan.used_fallback());
        assert_eq!(plan.signal.fallback_stage, STAGE_PLAN);

        let outline_result = provider
            .generate_outline(&OutlineRequest {
                project: &project,
                knowledge: &[],
            })
            .expect("outline");
        assert_eq!(outline_result.signal.fallback_stage, STAGE_TOC);
    }

    #[test]
    fn parses_fenced_and_wrapped_json() {
        let fenced = parse_json_object("```json\n{\"a\": 1}\n```").expect("fenced");
        assert_eq!(fenced, json!({"a": 1}));
        let wrapped = parse_json_object("Sure! {\"a\": {\"b\": 2}} Done.").expect("wrapped");
        assert_eq!(wrapped, json!({"a": {"b": 2}}));
        assert!(parse_json_object("no json here").is_err());
        assert!(parse_json_object("[1, 2]").is_err());
    }

    #[test]
    fn schema_rejects_review_without_score() {
        let err = validate_schema(&json!({"review": {"critique": "x"}}), REVIEW_SCHEMA)
            .unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
        validate_schema(&json!({"review": {"score": "85"}}), REVIEW_SCHEMA).expect("valid");
    }

    #[test]
    fn outline_that_does_not_normalize_is_unusable() {
        let err = decode_outline(json!({
            "outline": {"chapters": [{"number": 2, "title": "Skipped one"}]}
        }))
        .unwrap_err();
        assert!(format!("{err:#}").contains("sequential"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn echo_provider(response: &str, retries: u32) -> CommandProvider {
            CommandProvider::new(ProviderConfig {
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "cat >/dev/null; printf '%s' \"$1\"".to_string(),
                    "sh".to_string(),
                    response.to_string(),
                ],
                timeout_secs: 10,
                json_retries: retries,
                ..ProviderConfig::default()
            })
        }

        #[test]
        fn generated_review_is_unwrapped() {
            let provider = echo_provider(
                r#"{"review": {"score": 91, "should_revise": false, "issues": [], "critique": ""}}"#,
                0,
            );
            let project = project();
            let outline = outline_with_chapters(1);
            let plan = ChapterPlan::default();
            let payload = provider
                .review_chapter(&ReviewRequest {
                    chapter: chapter_request(&project, &outline),
                    plan: &plan,
                    chapter_content: "## Body",
                })
                .expect("review");
            assert!(!payload.used_fallback());
            assert_eq!(payload.value.score, 91);
        }

        #[test]
        fn generated_draft_gets_number_title_and_summary() {
            let provider = echo_provider(
                r###"{"chapter": {"number": 9, "content": "# T\n\n## A\nBody text"}}"###,
                0,
            );
            let project = project();
            let outline = outline_with_chapters(1);
            let plan = ChapterPlan::default();
            let payload = provider
                .draft_or_revise(&DraftRequest {
                    chapter: chapter_request(&project, &outline),
                    plan: &plan,
                    critique: "",
                    previous_draft: "",
                })
                .expect("draft");
            assert!(!payload.used_fallback());
            let draft = payload.value.chapter;
            assert_eq!(draft.number, 1);
            assert_eq!(draft.title, "Chapter 1: Idea 1");
            assert_eq!(draft.summary, "# T  ## A Body text");
        }

        #[test]
        fn invalid_output_falls_back_after_retries() {
            let provider = echo_provider("not json at all", 1);
            let project = project();
            let outline = outline_with_chapters(1);
            let payload = provider
                .plan_chapter(&chapter_request(&project, &outline))
                .expect("plan");
            assert!(payload.used_fallback());
            assert_eq!(payload.value, fallback::plan(&chapter_request(&project, &outline)));
        }

        #[test]
        fn retry_with_repair_note_recovers() {
            let temp = tempfile::tempdir().expect("tempdir");
            let marker = temp.path().join("attempted");
            let script = "cat >/dev/null; \
                if [ -f \"$1\" ]; then printf '%s' '{\"assistant_reply\": \"Which genre?\"}'; \
                else touch \"$1\"; printf 'oops'; fi";
            let provider = CommandProvider::new(ProviderConfig {
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                    "sh".to_string(),
                    marker.display().to_string(),
                ],
                timeout_secs: 10,
                json_retries: 1,
                ..ProviderConfig::default()
            });
            let project = project();
            let profile = serde_json::Map::new();
            let payload = provider
                .assist_profile(&ProfileRequest {
                    project: &project,
                    current_profile: &profile,
                    conversation: &[],
                    message: "hi",
                })
                .expect("profile");
            assert!(!payload.used_fallback());
            assert_eq!(payload.value.assistant_reply, "Which genre?");
        }

        #[test]
        fn failing_command_falls_back() {
            let provider = CommandProvider::new(ProviderConfig {
                command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
                timeout_secs: 10,
                json_retries: 0,
                ..ProviderConfig::default()
            });
            let project = project();
            let payload = provider
                .refine_outline(&RefineRequest {
                    project: &project,
                    existing_outline: None,
                    feedback: "tighter",
                    knowledge: &[],
                })
                .expect("refine");
            assert_eq!(payload.signal.fallback_stage, STAGE_REFINE_TOC);
        }
    }
}
