//! Typed input/validation errors.
//!
//! These are fatal: they are raised before (or instead of) any generation
//! work and travel inside `anyhow::Error`. Callers that need to branch on
//! them use `err.downcast_ref::<EngineError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("mode must be one of: toc | refine_toc | chapter | export | profile_assistant (got '{0}')")]
    InvalidMode(String),

    #[error("{0} is required")]
    MissingInput(&'static str),

    #[error("{0} must be a valid integer")]
    InvalidInteger(&'static str),

    #[error("project does not have an outline yet")]
    MissingOutline,

    #[error("chapter_number {requested} is outside outline range 1..={chapter_count}")]
    ChapterOutOfRange { requested: i64, chapter_count: usize },

    #[error("invalid outline: {0}")]
    InvalidOutline(String),

    #[error("generated chapter content is empty")]
    EmptyChapterContent,

    #[error("chapter subgraph returned no output")]
    EmptySubgraphOutput,

    #[error("export_format must be one of: markdown | json | both (got '{0}')")]
    UnsupportedExportFormat(String),

    #[error("no chapters found; generate at least one chapter before export")]
    NothingToExport,
}
