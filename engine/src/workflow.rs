//! Project-level effects shared by the router and the chapter subgraph:
//! context retrieval, chapter persistence, outline application, profile
//! updates, and export rendering.

use std::str::FromStr;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument};

use crate::core::outline::{normalize_outline, parse_int};
use crate::core::state::{ChapterContext, PersistedChapter};
use crate::core::types::{
    ChapterDraft, ChapterStatus, Outline, OutlineChapter, Project, ProjectStatus, StoredChapter,
    summarize, truncate_chars,
};
use crate::error::EngineError;
use crate::io::config::ContextConfig;
use crate::io::store::BookStore;

/// Knowledge notes are clipped to this many characters each.
const KNOWLEDGE_SNIPPET_CHARS: usize = 2000;

/// Project metadata key holding generated outline metadata.
pub const LLM_RUNTIME_KEY: &str = "llm_runtime";

pub const DEFAULT_CHAPTER_NEXT_STEPS: [&str; 1] = ["Review the chapter and proceed to the next one."];

const EXPORT_NEXT_STEPS: [&str; 3] = [
    "Download exported file(s).",
    "Review formatting in your editor.",
    "Publish or continue editing.",
];

/// The project's outline, re-validated. Errors when there is none.
pub fn active_outline(project: &Project) -> Result<Outline> {
    let outline = match &project.outline {
        Some(outline) if !outline.chapters.is_empty() => outline,
        _ => return Err(EngineError::MissingOutline.into()),
    };
    let raw = serde_json::to_value(outline).context("encode project outline")?;
    Ok(normalize_outline(&raw)?)
}

/// Gather the outline entry and continuity/knowledge snippets for one chapter.
///
/// `requested` is the raw `chapter_number` input. Fails before touching the
/// store when there is no outline, the input is not an integer, or the
/// number is outside `1..=chapter_count`.
#[instrument(skip_all, fields(project_id = %project.id))]
pub fn prepare_chapter_context(
    store: &dyn BookStore,
    project: &Project,
    requested: Option<&Value>,
    limits: &ContextConfig,
) -> Result<ChapterContext> {
    let outline = active_outline(project)?;
    let chapter_number = parse_int(requested, "chapter_number")?;
    let out_of_range = || EngineError::ChapterOutOfRange {
        requested: chapter_number,
        chapter_count: outline.chapter_count(),
    };
    let number = u32::try_from(chapter_number).map_err(|_| out_of_range())?;
    let target = outline.chapter(number).cloned().ok_or_else(out_of_range)?;

    let memory_snippets = memory_snippets(store, &project.id, number, limits.memory_limit)?;
    let knowledge_snippets = knowledge_snippets(store, &project.id, limits.knowledge_limit)?;

    debug!(
        memory = memory_snippets.len(),
        knowledge = knowledge_snippets.len(),
        "chapter context ready"
    );
    Ok(ChapterContext {
        outline,
        chapter_number: number,
        target,
        memory_snippets,
        knowledge_snippets,
    })
}

/// Non-empty knowledge notes in name order, each clipped.
pub fn knowledge_snippets(
    store: &dyn BookStore,
    project_id: &str,
    limit: usize,
) -> Result<Vec<String>> {
    Ok(store
        .knowledge_documents(project_id)?
        .into_iter()
        .filter(|doc| !doc.text.trim().is_empty())
        .take(limit)
        .map(|doc| {
            format!(
                "[{}] {}",
                doc.name,
                truncate_chars(doc.text.trim(), KNOWLEDGE_SNIPPET_CHARS)
            )
        })
        .collect())
}

/// Summaries of earlier written chapters, most recent first.
fn memory_snippets(
    store: &dyn BookStore,
    project_id: &str,
    before: u32,
    limit: usize,
) -> Result<Vec<String>> {
    let mut chapters = store.list_chapters(project_id)?;
    chapters.retain(|chapter| chapter.number < before && !chapter.content.trim().is_empty());
    chapters.sort_by(|a, b| b.number.cmp(&a.number));
    Ok(chapters
        .into_iter()
        .take(limit)
        .map(|chapter| {
            let summary = if chapter.summary.trim().is_empty() {
                summarize(&chapter.content)
            } else {
                chapter.summary.trim().to_string()
            };
            format!("Chapter {} ({}): {summary}", chapter.number, chapter.title)
        })
        .collect())
}

/// Everything the persist node hands to storage.
#[derive(Debug, Clone)]
pub struct PersistRequest<'a> {
    pub outline: &'a Outline,
    pub target: &'a OutlineChapter,
    pub draft: &'a ChapterDraft,
    pub metadata: Map<String, Value>,
    pub next_steps: Vec<String>,
}

/// Store the chapter (overwriting any earlier version with the same number)
/// and move the project to `writing`.
#[instrument(skip_all, fields(project_id = %project.id, chapter_number = request.target.number))]
pub fn persist_chapter(
    store: &dyn BookStore,
    project: &mut Project,
    request: PersistRequest<'_>,
) -> Result<PersistedChapter> {
    let number = request.target.number;
    let content = request.draft.content.trim();
    if content.is_empty() {
        return Err(EngineError::EmptyChapterContent.into());
    }
    let title = [request.draft.title.trim(), request.target.title.trim()]
        .into_iter()
        .find(|title| !title.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Chapter {number}"));

    let stored = StoredChapter {
        number,
        title,
        content: content.to_string(),
        summary: request.draft.summary.trim().to_string(),
        status: ChapterStatus::Generated,
    };
    store
        .save_chapter(&project.id, &stored)
        .with_context(|| format!("save chapter {number}"))?;

    project.status = ProjectStatus::Writing;
    store.save_project(project).context("save project status")?;
    info!(chapter_number = number, "chapter persisted");

    let next_steps = if request.next_steps.is_empty() {
        to_strings(&DEFAULT_CHAPTER_NEXT_STEPS)
    } else {
        request.next_steps
    };
    Ok(PersistedChapter {
        status: "success".to_string(),
        outline: request.outline.clone(),
        chapter: ChapterDraft {
            number: stored.number,
            title: stored.title,
            content: stored.content,
            summary: stored.summary,
        },
        metadata: request.metadata,
        next_steps,
    })
}

/// Replace the project outline, merge outline metadata, and create pending
/// chapter records for numbers that have none yet.
///
/// Generated metadata lives under `llm_runtime`; the caller's own metadata
/// keys are left as they are.
#[instrument(skip_all, fields(project_id = %project.id, chapters = outline.chapter_count()))]
pub fn apply_outline(
    store: &dyn BookStore,
    project: &mut Project,
    outline: &Outline,
    metadata: &Map<String, Value>,
) -> Result<()> {
    project.outline = Some(outline.clone());
    let runtime = project
        .metadata
        .entry(LLM_RUNTIME_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !runtime.is_object() {
        *runtime = Value::Object(Map::new());
    }
    if let Value::Object(runtime) = runtime {
        runtime.extend(metadata.iter().map(|(key, value)| (key.clone(), value.clone())));
    }
    project.status = ProjectStatus::Outlined;
    store.save_project(project).context("save outlined project")?;
    sync_chapters_from_outline(store, &project.id, outline)
}

fn sync_chapters_from_outline(
    store: &dyn BookStore,
    project_id: &str,
    outline: &Outline,
) -> Result<()> {
    let mut created = 0usize;
    for chapter in &outline.chapters {
        if store.load_chapter(project_id, chapter.number)?.is_some() {
            continue;
        }
        store.save_chapter(
            project_id,
            &StoredChapter::pending(chapter.number, &chapter.title),
        )?;
        created += 1;
    }
    debug!(created, "pending chapters synced from outline");
    Ok(())
}

/// Apply a finalized profile interview to the project's brief fields.
///
/// Text fields are trimmed and clipped; `length` becomes the target word
/// count (at least 300) when it parses as a number. The raw updates are also
/// merged into `project.profile`.
pub fn apply_profile_updates(
    store: &dyn BookStore,
    project: &mut Project,
    updates: &Map<String, Value>,
) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let text = |field: &str, limit: usize| {
        updates
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| truncate_chars(value, limit))
    };
    if let Some(title) = text("title", 160) {
        project.title = title;
    }
    if let Some(genre) = text("genre", 80) {
        project.genre = genre;
    }
    if let Some(audience) = text("audience", 80) {
        project.target_audience = audience;
    }
    if let Some(language) = text("language", 40) {
        project.language = language;
    }
    if let Some(tone) = text("tone", 80) {
        project.tone = tone;
    }
    if let Some(words) = updates.get("length").and_then(parse_word_count) {
        project.target_word_count = words.max(300);
    }
    project
        .profile
        .extend(updates.iter().map(|(key, value)| (key.clone(), value.clone())));
    store.save_project(project).context("save profile updates")?;
    info!(fields = updates.len(), "profile updates applied");
    Ok(())
}

fn parse_word_count(raw: &Value) -> Option<u32> {
    let parsed = match raw {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    if !parsed.is_finite() || parsed < 0.0 {
        return None;
    }
    Some(parsed.trunc().min(f64::from(u32::MAX)) as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Json,
    Both,
}

impl ExportFormat {
    fn markdown(self) -> bool {
        matches!(self, ExportFormat::Markdown | ExportFormat::Both)
    }

    fn json(self) -> bool {
        matches!(self, ExportFormat::Json | ExportFormat::Both)
    }
}

impl FromStr for ExportFormat {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "markdown" | "md" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            "both" => Ok(ExportFormat::Both),
            _ => Err(EngineError::UnsupportedExportFormat(raw.to_string())),
        }
    }
}

/// Render the written chapters and store the artifacts.
///
/// Pending chapters (no content yet) are left out; at least one written
/// chapter is required.
#[instrument(skip_all, fields(project_id = %project.id, format = ?format))]
pub fn export_project(
    store: &dyn BookStore,
    project: &mut Project,
    format: ExportFormat,
) -> Result<Map<String, Value>> {
    let outline = active_outline(project)?;
    let chapters: Vec<StoredChapter> = store
        .list_chapters(&project.id)?
        .into_iter()
        .filter(|chapter| !chapter.content.trim().is_empty())
        .collect();
    if chapters.is_empty() {
        return Err(EngineError::NothingToExport.into());
    }

    let stem = safe_file_stem(&project.title);
    let mut output = Map::new();
    output.insert("status".to_string(), json!("success"));
    output.insert("warnings".to_string(), json!([]));
    output.insert("used_fallback".to_string(), json!(false));
    output.insert("fallback_stages".to_string(), json!([]));
    if format.markdown() {
        let file_name = format!("{stem}.md");
        let location = store.write_export(
            &project.id,
            &file_name,
            &render_markdown(project, &outline, &chapters),
        )?;
        debug!(%location, "markdown export written");
        output.insert("markdown_filename".to_string(), json!(file_name));
    }
    if format.json() {
        let file_name = format!("{stem}.json");
        let mut body = serde_json::to_string_pretty(&render_json(project, &outline, &chapters))
            .context("encode json export")?;
        body.push('\n');
        let location = store.write_export(&project.id, &file_name, &body)?;
        debug!(%location, "json export written");
        output.insert("json_filename".to_string(), json!(file_name));
    }

    project.status = ProjectStatus::Exported;
    store.save_project(project).context("save exported project")?;
    info!(chapters = chapters.len(), "project exported");

    output.insert("outline".to_string(), json!(outline));
    output.insert("next_steps".to_string(), json!(EXPORT_NEXT_STEPS));
    Ok(output)
}

fn render_markdown(project: &Project, outline: &Outline, chapters: &[StoredChapter]) -> String {
    let mut buf = format!("# {}\n\n", project.title.trim());
    if !outline.synopsis.trim().is_empty() {
        buf.push_str(outline.synopsis.trim());
        buf.push_str("\n\n");
    }
    buf.push_str("## Contents\n\n");
    for chapter in &outline.chapters {
        buf.push_str(&format!("{}. {}\n", chapter.number, chapter.title));
    }
    for chapter in chapters {
        buf.push_str("\n---\n\n");
        let content = chapter.content.trim();
        if !content.starts_with('#') {
            buf.push_str(&format!("# {}\n\n", chapter.title));
        }
        buf.push_str(content);
        buf.push('\n');
    }
    buf
}

fn render_json(project: &Project, outline: &Outline, chapters: &[StoredChapter]) -> Value {
    json!({
        "title": project.title,
        "genre": project.genre,
        "target_audience": project.target_audience,
        "language": project.language,
        "tone": project.tone,
        "outline": outline,
        "chapters": chapters
            .iter()
            .map(|chapter| json!({
                "number": chapter.number,
                "title": chapter.title,
                "content": chapter.content,
                "summary": chapter.summary,
            }))
            .collect::<Vec<_>>(),
    })
}

/// File-name-safe version of a title: reserved characters and spaces become
/// `_`, at most 100 characters, `book` when nothing is left.
fn safe_file_stem(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect();
    let stem = replaced.trim().trim_matches('.').replace(' ', "_");
    let stem = truncate_chars(&stem, 100);
    if stem.is_empty() {
        "book".to_string()
    } else {
        stem
    }
}

pub(crate) fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}
