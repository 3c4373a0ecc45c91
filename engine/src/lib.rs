//! Book-writing workflow engine.
//!
//! A run executes one mode against a book project: generate or refine the
//! outline, write a chapter through a plan/draft/review loop, export the
//! book, or interview the author for their brief. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state, review merge, guardrails,
//!   outline normalization, fallback aggregation). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (file store, config, prompt
//!   rendering, the command-backed generation provider).
//!
//! Orchestration modules ([`router`], [`chapter`], [`workflow`], [`run`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod chapter;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod provider;
pub mod router;
pub mod run;
pub mod telemetry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
