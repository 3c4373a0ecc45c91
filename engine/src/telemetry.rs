//! Node-level progress tracking with a fire-and-forget persistence side channel.
//!
//! Every node boundary produces a fresh [`TelemetrySnapshot`] (the caller's
//! prior snapshot is never mutated) and hands it to a [`TelemetrySink`].
//! Sinks swallow their own failures: telemetry never interferes with
//! generation.

use std::time::Instant;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::state::TelemetrySnapshot;

/// Default cap on `progress.last_error`, in characters.
pub const DEFAULT_ERROR_LIMIT_CHARS: usize = 500;

/// Best-effort persistence of a run's progress and node timings.
///
/// Implementations never return errors and never panic; a run that cannot be
/// found is a no-op.
pub trait TelemetrySink {
    fn persist(&self, run_id: &str, snapshot: &TelemetrySnapshot);
}

/// Sink that drops every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn persist(&self, _run_id: &str, _snapshot: &TelemetrySnapshot) {}
}

/// How a node finished: the revision count to report and optional meta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeEnd {
    pub revision_count: u32,
    pub meta: Option<Value>,
}

/// Records start/end/error events for one run.
pub struct ProgressTracker<'a> {
    run_id: String,
    sink: &'a dyn TelemetrySink,
    error_limit: usize,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(run_id: &str, sink: &'a dyn TelemetrySink) -> Self {
        Self {
            run_id: run_id.to_string(),
            sink,
            error_limit: DEFAULT_ERROR_LIMIT_CHARS,
        }
    }

    pub fn with_error_limit(mut self, error_limit: usize) -> Self {
        self.error_limit = error_limit;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn on_start(
        &self,
        snapshot: &TelemetrySnapshot,
        node: &str,
        revision_count: u32,
    ) -> TelemetrySnapshot {
        debug!(node, revision_count, "node started");
        let next = TelemetrySnapshot {
            progress: snapshot.progress.started(node, revision_count),
            node_timings: snapshot.node_timings.clone(),
        };
        self.persist(&next);
        next
    }

    pub fn on_end(
        &self,
        snapshot: &TelemetrySnapshot,
        node: &str,
        elapsed_ms: u64,
        end: NodeEnd,
    ) -> TelemetrySnapshot {
        debug!(node, elapsed_ms, revision_count = end.revision_count, "node completed");
        let next = TelemetrySnapshot {
            progress: snapshot
                .progress
                .completed(node, end.revision_count, end.meta),
            node_timings: snapshot.node_timings.with(node, elapsed_ms),
        };
        self.persist(&next);
        next
    }

    /// Record a failure. The caller still owns (and re-raises) the error.
    pub fn on_error(
        &self,
        snapshot: &TelemetrySnapshot,
        node: &str,
        elapsed_ms: Option<u64>,
        revision_count: u32,
        error: &anyhow::Error,
    ) -> TelemetrySnapshot {
        let message = format!("{error:#}");
        warn!(node, err = %message, "workflow node failed");
        let node_timings = match elapsed_ms {
            Some(ms) => snapshot.node_timings.with(node, ms),
            None => snapshot.node_timings.clone(),
        };
        let next = TelemetrySnapshot {
            progress: snapshot
                .progress
                .failed(node, revision_count, &message, self.error_limit),
            node_timings,
        };
        self.persist(&next);
        next
    }

    /// Run `body` inside the standard node envelope.
    ///
    /// Marks `node` running, times `body`, then marks it completed with the
    /// [`NodeEnd`] derived from the result, or failed with the error, which is
    /// returned unchanged. `snapshot` always holds the latest telemetry.
    pub fn node<T>(
        &self,
        snapshot: &mut TelemetrySnapshot,
        node: &str,
        revision_count: u32,
        body: impl FnOnce() -> Result<T>,
        finish: impl FnOnce(&T) -> NodeEnd,
    ) -> Result<T> {
        *snapshot = self.on_start(snapshot, node, revision_count);
        let started = Instant::now();
        match body() {
            Ok(value) => {
                let end = finish(&value);
                *snapshot = self.on_end(snapshot, node, elapsed_ms(started), end);
                Ok(value)
            }
            Err(err) => {
                *snapshot =
                    self.on_error(snapshot, node, Some(elapsed_ms(started)), revision_count, &err);
                Err(err)
            }
        }
    }

    fn persist(&self, snapshot: &TelemetrySnapshot) {
        if self.run_id.is_empty() {
            return;
        }
        self.sink.persist(&self.run_id, snapshot);
    }
}

pub fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
