//! Prompt rendering for each generation stage.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed in a fixed order (bulk context first), then the last section is
//! truncated.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::provider::{
    ChapterRequest, DraftRequest, OutlineRequest, ProfileRequest, RefineRequest, ReviewRequest,
    fallback::REQUIRED_PROFILE_FIELDS,
};

const TEMPLATES: [(&str, &str); 8] = [
    ("_book.md", include_str!("prompts/_book.md")),
    ("_context.md", include_str!("prompts/_context.md")),
    ("plan", include_str!("prompts/plan.md")),
    ("draft", include_str!("prompts/draft.md")),
    ("review", include_str!("prompts/review.md")),
    ("outline", include_str!("prompts/outline.md")),
    ("refine_outline", include_str!("prompts/refine_outline.md")),
    ("profile_assistant", include_str!("prompts/profile_assistant.md")),
];

/// Sections dropped first when over budget.
const DROP_ORDER: [&str; 7] = [
    "knowledge",
    "memory",
    "previous",
    "history",
    "outline",
    "plan",
    "profile",
];

const SECTION_SEPARATOR: &str = "\n\n";
const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Previous drafts and chapter text are clipped before rendering.
const DRAFT_CHARS: usize = 12_000;
const REVIEW_CHARS: usize = 18_000;

pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .expect("bundled prompt template should be valid");
        }
        Self { env, budget_bytes }
    }

    pub fn render_plan(&self, request: &ChapterRequest<'_>) -> Result<String> {
        let rendered = self.env.get_template("plan")?.render(context! {
            chapter_number => request.chapter_number,
            chapter_title => request.chapter_title(),
            bullet_points => request.bullet_points(),
            rich_elements => request.project.requested_rich_elements(),
            outline => pretty(request.outline)?,
            memory => request.memory,
            knowledge => request.knowledge,
            ..book_context(request.project)?
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_draft(&self, request: &DraftRequest<'_>) -> Result<String> {
        let chapter = &request.chapter;
        let rendered = self.env.get_template("draft")?.render(context! {
            chapter_number => chapter.chapter_number,
            chapter_title => chapter.chapter_title(),
            plan => pretty(request.plan)?,
            critique => request.critique.trim(),
            previous_draft => clip(request.previous_draft, DRAFT_CHARS),
            memory => chapter.memory,
            knowledge => chapter.knowledge,
            ..book_context(chapter.project)?
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_review(&self, request: &ReviewRequest<'_>) -> Result<String> {
        let chapter = &request.chapter;
        let rendered = self.env.get_template("review")?.render(context! {
            chapter_number => chapter.chapter_number,
            chapter_title => chapter.chapter_title(),
            plan => pretty(request.plan)?,
            chapter_content => clip(request.chapter_content, REVIEW_CHARS),
            memory => chapter.memory,
            knowledge => chapter.knowledge,
            ..book_context(chapter.project)?
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_outline(&self, request: &OutlineRequest<'_>) -> Result<String> {
        let recommended = (request.project.target_word_count / 3000).clamp(6, 14);
        let rendered = self.env.get_template("outline")?.render(context! {
            recommended_chapters => recommended,
            knowledge => request.knowledge,
            ..book_context(request.project)?
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_refine(&self, request: &RefineRequest<'_>) -> Result<String> {
        let existing = match request.existing_outline {
            Some(outline) => pretty(outline)?,
            None => String::new(),
        };
        let rendered = self.env.get_template("refine_outline")?.render(context! {
            feedback => request.feedback.trim(),
            existing_outline => existing,
            knowledge => request.knowledge,
            ..book_context(request.project)?
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_profile(&self, request: &ProfileRequest<'_>) -> Result<String> {
        let conversation: Vec<minijinja::Value> = request
            .conversation
            .iter()
            .filter_map(conversation_turn)
            .collect();
        let rendered = self.env.get_template("profile_assistant")?.render(context! {
            required_fields => REQUIRED_PROFILE_FIELDS,
            current_profile => pretty(request.current_profile)?,
            conversation => conversation,
            message => request.message.trim(),
            ..book_context(request.project)?
        })?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|section| section.content.as_str())
            .collect::<Vec<_>>()
            .join(SECTION_SEPARATOR)
    }
}

fn book_context(project: &crate::core::types::Project) -> Result<minijinja::Value> {
    let profile = if project.profile.is_empty() {
        String::new()
    } else {
        pretty(&project.profile)?
    };
    Ok(context! {
        project => project,
        profile => profile,
    })
}

/// `{"role", "content"}` turn from the assistant or the user, clipped.
fn conversation_turn(turn: &Value) -> Option<minijinja::Value> {
    let role = turn.get("role")?.as_str()?.trim().to_lowercase();
    let content = turn.get("content")?.as_str()?.trim();
    if !matches!(role.as_str(), "assistant" | "user") || content.is_empty() {
        return None;
    }
    Some(context! { role => role, content => clip(content, 700) })
}

fn pretty<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn clip(text: &str, limit: usize) -> String {
    text.trim().chars().take(limit).collect()
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern is valid")
});

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Byte length of the prompt `sections` join into, separators included.
fn rendered_len(sections: &[Section]) -> usize {
    let content: usize = sections.iter().map(|section| section.content.len()).sum();
    content + SECTION_SEPARATOR.len() * sections.len().saturating_sub(1)
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if rendered_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections
            .iter()
            .position(|section| section.key == key && !section.required)
        {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    // Truncate from the end; a section too short to absorb the overflow goes
    // entirely and the one before it is cut instead.
    while !sections.is_empty() {
        let over = rendered_len(sections).saturating_sub(budget);
        if over == 0 {
            return;
        }
        let last = sections.len() - 1;
        let section = &mut sections[last];
        let needed = over + TRUNCATION_MARKER.len();
        if section.content.len() <= needed {
            debug!(section = %section.key, "removed prompt section for budget");
            sections.pop();
            continue;
        }
        let mut cut = section.content.len() - needed;
        while cut > 0 && !section.content.is_char_boundary(cut) {
            cut -= 1;
        }
        section.content.truncate(cut);
        section.content.push_str(TRUNCATION_MARKER);
        debug!(section = %section.key, after_len = section.content.len(), "truncated prompt section");
        return;
    }
}
