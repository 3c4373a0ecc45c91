//! Generation provider contract and the deterministic fallbacks behind it.
//!
//! The [`GenerationProvider`] trait decouples orchestration from the actual
//! model backend. Every operation returns a [`StagePayload`]: the domain value
//! plus a [`FallbackSignal`] saying whether a deterministic substitute was
//! used. An `Err` is reserved for failures the provider cannot degrade around.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::fallback::FallbackSignal;
use crate::core::review::ModelReview;
use crate::core::types::{ChapterDraft, ChapterPlan, Outline, Project};

pub const STAGE_PLAN: &str = "chapter_plan";
pub const STAGE_DRAFT: &str = "chapter_draft";
pub const STAGE_REVIEW: &str = "chapter_review";
pub const STAGE_TOC: &str = "toc";
pub const STAGE_REFINE_TOC: &str = "refine_toc";
pub const STAGE_PROFILE_ASSISTANT: &str = "profile_assistant";

/// A stage's domain value together with its fallback marker.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePayload<T> {
    pub value: T,
    pub signal: FallbackSignal,
}

impl<T> StagePayload<T> {
    pub fn generated(value: T) -> Self {
        Self {
            value,
            signal: FallbackSignal::none(),
        }
    }

    pub fn fallback(value: T, stage: &str) -> Self {
        Self {
            value,
            signal: FallbackSignal::fallback(stage),
        }
    }

    pub fn used_fallback(&self) -> bool {
        self.signal.used_fallback
    }
}

/// Inputs shared by every chapter-level operation.
#[derive(Debug, Clone, Copy)]
pub struct ChapterRequest<'a> {
    pub project: &'a Project,
    pub outline: &'a Outline,
    pub chapter_number: u32,
    pub memory: &'a [String],
    pub knowledge: &'a [String],
}

impl ChapterRequest<'_> {
    pub fn chapter_title(&self) -> String {
        self.outline.chapter_title(self.chapter_number)
    }

    pub fn bullet_points(&self) -> &[String] {
        self.outline.bullet_points(self.chapter_number)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DraftRequest<'a> {
    pub chapter: ChapterRequest<'a>,
    pub plan: &'a ChapterPlan,
    /// Critique from the previous review; empty for a first draft.
    pub critique: &'a str,
    /// Content of the previous draft; empty for a first draft.
    pub previous_draft: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct ReviewRequest<'a> {
    pub chapter: ChapterRequest<'a>,
    pub plan: &'a ChapterPlan,
    pub chapter_content: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct OutlineRequest<'a> {
    pub project: &'a Project,
    pub knowledge: &'a [String],
}

#[derive(Debug, Clone, Copy)]
pub struct RefineRequest<'a> {
    pub project: &'a Project,
    pub existing_outline: Option<&'a Outline>,
    pub feedback: &'a str,
    pub knowledge: &'a [String],
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileRequest<'a> {
    pub project: &'a Project,
    pub current_profile: &'a Map<String, Value>,
    /// Most recent turns only (`{"role", "content"}` objects).
    pub conversation: &'a [Value],
    pub message: &'a str,
}

/// Output of a draft or revision call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftResult {
    pub chapter: ChapterDraft,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

/// Output of outline generation or refinement. The outline stays raw until
/// the router normalizes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutlineResult {
    pub outline: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileAssistantReply {
    pub assistant_reply: String,
    #[serde(default)]
    pub field_updates: Map<String, Value>,
    #[serde(default)]
    pub next_field: String,
    #[serde(default)]
    pub is_finalized: bool,
    #[serde(default)]
    pub missing_required: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Abstraction over generation backends.
pub trait GenerationProvider {
    fn plan_chapter(&self, request: &ChapterRequest<'_>) -> Result<StagePayload<ChapterPlan>>;

    fn draft_or_revise(&self, request: &DraftRequest<'_>) -> Result<StagePayload<DraftResult>>;

    fn review_chapter(&self, request: &ReviewRequest<'_>) -> Result<StagePayload<ModelReview>>;

    fn generate_outline(&self, request: &OutlineRequest<'_>)
    -> Result<StagePayload<OutlineResult>>;

    fn refine_outline(&self, request: &RefineRequest<'_>) -> Result<StagePayload<OutlineResult>>;

    fn assist_profile(
        &self,
        request: &ProfileRequest<'_>,
    ) -> Result<StagePayload<ProfileAssistantReply>>;
}

/// Deterministic substitutes used whenever the backend is unavailable or
/// returns unusable output.
pub mod fallback {
    use serde_json::{Map, Value, json};

    use super::{ChapterRequest, DraftResult, OutlineResult, ProfileAssistantReply};
    use crate::core::review::ModelReview;
    use crate::core::types::{
        ChapterDraft, ChapterPlan, Outline, OutlineChapter, PlanSection, Project,
        RichElementSuggestion, summarize, truncate_chars,
    };

    const SKIPPED_RICH_ELEMENTS: [&str; 3] = ["figure", "flowchart", "list"];

    /// Plan with one section per outline bullet point.
    pub fn plan(request: &ChapterRequest<'_>) -> ChapterPlan {
        let title = request.chapter_title();
        let points = request.bullet_points();
        let headings: Vec<String> = if points.is_empty() {
            vec!["Core development".to_string()]
        } else {
            points.iter().map(|point| truncate_chars(point, 80)).collect()
        };
        ChapterPlan {
            chapter_number: request.chapter_number,
            chapter_title: title.clone(),
            objective: format!("Deliver the key value of {title} clearly and progressively."),
            sections: headings
                .into_iter()
                .map(|heading| PlanSection {
                    heading: if heading.is_empty() {
                        "Core Section".to_string()
                    } else {
                        heading
                    },
                    purpose: "Expand this beat".to_string(),
                    evidence_or_example: "Use a concrete example".to_string(),
                })
                .collect(),
            continuity_notes: vec!["Maintain tone and continuity with previous chapters.".to_string()],
            concept_alignment: "Stay aligned to the original user concept and audience.".to_string(),
            rich_elements_plan: rich_elements(points, &request.project.requested_rich_elements()),
            extra: Map::new(),
        }
    }

    /// At most two optional rich elements, anchored to the first bullet point.
    fn rich_elements(points: &[String], requested: &[&str]) -> Vec<RichElementSuggestion> {
        let anchor = points
            .first()
            .map(String::as_str)
            .unwrap_or("Main development");
        let section = truncate_chars(anchor, 120);
        requested
            .iter()
            .filter(|kind| !SKIPPED_RICH_ELEMENTS.contains(*kind))
            .take(2)
            .map(|kind| RichElementSuggestion {
                kind: (*kind).to_string(),
                section: section.clone(),
                purpose: "Improve clarity and teaching value for this chapter.".to_string(),
                required: false,
            })
            .collect()
    }

    /// Skeleton chapter built from the outline entry.
    pub fn draft(request: &ChapterRequest<'_>) -> DraftResult {
        let project = request.project;
        let title = request.chapter_title();
        let bullets = if request.bullet_points().is_empty() {
            "- Expand the central idea.".to_string()
        } else {
            request
                .bullet_points()
                .iter()
                .map(|point| format!("- {point}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let content = [
            format!("# {title}"),
            format!(
                "This chapter introduces {title} in a {} voice.",
                project.tone.to_lowercase()
            ),
            "## Development".to_string(),
            bullets,
            "## Closing".to_string(),
            "This section reinforces the chapter objective and bridges to the next.".to_string(),
        ]
        .join("\n\n");

        let mut metadata = Map::new();
        metadata.insert(
            "key_themes".to_string(),
            json!([project.genre, "narrative coherence"]),
        );
        metadata.insert("seo_keywords".to_string(), json!([project.title, title]));

        DraftResult {
            chapter: ChapterDraft {
                number: request.chapter_number,
                summary: summarize(&content),
                title,
                content,
            },
            metadata,
            next_steps: vec![
                "Review chapter output.".to_string(),
                "Regenerate with tighter feedback if needed.".to_string(),
                "Proceed to the next chapter.".to_string(),
            ],
        }
    }

    /// Length-only review: 82 for at least 350 words, 68 otherwise.
    pub fn review(chapter_content: &str) -> ModelReview {
        let score = if chapter_content.split_whitespace().count() >= 350 {
            82
        } else {
            68
        };
        let should_revise = score < 80;
        ModelReview {
            score,
            should_revise,
            issues: if should_revise {
                vec!["Chapter is too thin for publication quality.".to_string()]
            } else {
                Vec::new()
            },
            critique: if should_revise {
                "Increase depth, examples, and continuity links to prior chapters.".to_string()
            } else {
                String::new()
            },
            extra: Map::new(),
        }
    }

    /// Evenly structured outline sized from the target word count.
    pub fn outline(project: &Project) -> OutlineResult {
        let chapter_count = (project.target_word_count / 2500).clamp(6, 14);
        let chapters: Vec<OutlineChapter> = (1..=chapter_count)
            .map(|i| OutlineChapter {
                number: i,
                title: format!("Chapter {i}: Core Idea {i}"),
                bullet_points: vec![
                    format!("Purpose of chapter {i}"),
                    format!("Key argument or scene {i}"),
                    format!("Evidence or development path {i}"),
                    if i < chapter_count {
                        format!("Transition to chapter {}", i + 1)
                    } else {
                        "Synthesis and close".to_string()
                    },
                ],
            })
            .collect();
        let outline = Outline {
            synopsis: format!(
                "'{}' is a {} book for {} written in a {} tone.",
                project.title,
                project.genre.to_lowercase(),
                project.target_audience.to_lowercase(),
                project.tone.to_lowercase()
            ),
            chapters,
        };

        let mut metadata = Map::new();
        metadata.insert(
            "estimated_word_count".to_string(),
            json!(project.target_word_count),
        );
        metadata.insert("chapter_count".to_string(), json!(chapter_count));
        metadata.insert("pacing".to_string(), json!("moderate"));
        metadata.insert(
            "themes".to_string(),
            json!([project.genre, "clarity", "progression"]),
        );

        OutlineResult {
            outline: json!(outline),
            metadata,
            next_steps: vec![
                "Review and edit the generated outline.".to_string(),
                "Run refine_outline with explicit feedback.".to_string(),
                "Generate chapters sequentially.".to_string(),
            ],
        }
    }

    /// [`outline`] marked as refined.
    pub fn refined_outline(project: &Project) -> OutlineResult {
        let mut result = outline(project);
        if let Some(Value::String(synopsis)) = result.outline.get_mut("synopsis") {
            synopsis.push_str(" (Refined per feedback.)");
        }
        result
    }

    pub const REQUIRED_PROFILE_FIELDS: [&str; 6] =
        ["title", "genre", "audience", "language", "tone", "length"];

    /// Required profile fields that are absent, blank, or empty.
    pub fn missing_required(profile: &Map<String, Value>) -> Vec<String> {
        REQUIRED_PROFILE_FIELDS
            .iter()
            .filter(|field| is_blank(profile.get(**field)))
            .map(|field| (*field).to_string())
            .collect()
    }

    fn is_blank(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(text)) => text.trim().is_empty(),
            Some(Value::Array(items)) => items.is_empty(),
            Some(_) => false,
        }
    }

    fn question_for(field: &str) -> &'static str {
        match field {
            "title" => "What is your book title or working title?",
            "genre" => "Which genre fits best for this book?",
            "audience" => "Who is the exact target audience?",
            "language" => "Which language should the book be written in?",
            "tone" => "Which tone should we use?",
            "length" => "What target word count are you aiming for?",
            _ => "Share the next detail and I will map it into your brief.",
        }
    }

    fn suggestions_for(field: &str) -> Vec<String> {
        let options: &[&str] = match field {
            "title" => &["Suggest a working title", "I have a title in mind"],
            "genre" => &["Non-fiction", "Fiction", "Help me decide"],
            "audience" => &["Beginners", "Professionals", "General readers"],
            "language" => &["English", "Spanish", "French"],
            "tone" => &["Conversational", "Authoritative", "Inspirational"],
            "length" => &["30000 words", "50000 words", "You decide"],
            _ => &[],
        };
        options.iter().map(|option| (*option).to_string()).collect()
    }

    fn wants_finalize(message: &str) -> bool {
        let message = message.to_lowercase();
        ["finalize", "finalise", "keep defaults", "looks good", "you decide"]
            .iter()
            .any(|phrase| message.contains(phrase))
    }

    /// Ask for the next missing required field, or confirm finalization.
    pub fn profile_reply(profile: &Map<String, Value>, message: &str) -> ProfileAssistantReply {
        let missing = missing_required(profile);
        match missing.first() {
            Some(next_field) => {
                let question = question_for(next_field);
                let assistant_reply = if wants_finalize(message) {
                    format!("Before finalizing, I still need one detail: {next_field}. {question}")
                } else {
                    question.to_string()
                };
                ProfileAssistantReply {
                    assistant_reply,
                    field_updates: Map::new(),
                    next_field: next_field.clone(),
                    is_finalized: false,
                    suggestions: suggestions_for(next_field),
                    missing_required: missing,
                }
            }
            None if wants_finalize(message) => ProfileAssistantReply {
                assistant_reply:
                    "Great. I have applied the brief to the form. Please review and generate when ready."
                        .to_string(),
                is_finalized: true,
                ..ProfileAssistantReply::default()
            },
            None => ProfileAssistantReply {
                assistant_reply:
                    "I have all required details. If you agree, reply 'finalize' to apply them to the form."
                        .to_string(),
                suggestions: vec![
                    "yes finalize".to_string(),
                    "review first".to_string(),
                    "one more change".to_string(),
                ],
                ..ProfileAssistantReply::default()
            },
        }
    }
}
