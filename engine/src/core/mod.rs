//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod fallback;
pub mod guardrails;
pub mod outline;
pub mod review;
pub mod state;
pub mod types;
