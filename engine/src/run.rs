//! Run lifecycle: queue a run record, then execute it against the store.
//!
//! A run moves `queued -> running -> completed | failed`. While it runs, the
//! telemetry sink writes progress into the same record, so the final write
//! reloads the record first and only replaces what the engine owns.

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::types::{RunRecord, RunStatus, truncate_chars};
use crate::io::config::EngineConfig;
use crate::io::store::{BookStore, RunStore, RunTelemetrySink};
use crate::provider::GenerationProvider;
use crate::router::{Engine, RunIds};

/// Cap on the stored `error_message`, in characters.
pub const RUN_ERROR_LIMIT_CHARS: usize = 2_000;

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Create and store a queued run. The mode is checked when the run executes.
pub fn submit(
    runs: &dyn RunStore,
    project_id: &str,
    mode: &str,
    input: Map<String, Value>,
) -> Result<RunRecord> {
    let run = RunRecord {
        id: Uuid::new_v4().to_string(),
        trace_id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        mode: mode.trim().to_string(),
        input,
        output: Map::new(),
        timings: Map::new(),
        status: RunStatus::Queued,
        error_message: None,
        created_at: now(),
        started_at: None,
        finished_at: None,
    };
    runs.save_run(&run)?;
    info!(run_id = %run.id, project_id, mode = %run.mode, "run queued");
    Ok(run)
}

/// Execute a stored run and record the outcome on it.
///
/// On success the record holds the output, the timings and `completed`. On
/// failure it holds `failed` and the error message, and the error is
/// returned. Either way `finished_at` is set.
#[instrument(skip_all, fields(run_id = run_id))]
pub fn execute_run<S: BookStore + RunStore>(
    store: &S,
    provider: &dyn GenerationProvider,
    config: &EngineConfig,
    run_id: &str,
) -> Result<RunRecord> {
    let mut run = store
        .load_run(run_id)?
        .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
    run.status = RunStatus::Running;
    run.started_at = Some(now());
    run.error_message = None;
    store.save_run(&run)?;

    let result = route(store, provider, config, &run);

    // Telemetry may have written to the record in the meantime.
    let mut run = store.load_run(run_id)?.unwrap_or(run);
    run.finished_at = Some(now());
    match result {
        Ok(mut output) => {
            if let Some(Value::Object(timings)) = output.get("timings_ms") {
                run.timings = timings.clone();
            }
            // Keep progress written by the sink when the handler has none.
            if let Some(progress) = run.output.remove("progress") {
                output.entry("progress").or_insert(progress);
            }
            run.output = output;
            run.status = RunStatus::Completed;
            store.save_run(&run)?;
            info!(mode = %run.mode, "run completed");
            Ok(run)
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(mode = %run.mode, err = %message, "run failed");
            run.status = RunStatus::Failed;
            run.error_message = Some(truncate_chars(&message, RUN_ERROR_LIMIT_CHARS));
            store.save_run(&run)?;
            Err(err)
        }
    }
}

fn route<S: BookStore + RunStore>(
    store: &S,
    provider: &dyn GenerationProvider,
    config: &EngineConfig,
    run: &RunRecord,
) -> Result<Map<String, Value>> {
    let mut project = store.load_project(&run.project_id)?;
    let sink = RunTelemetrySink::new(store);
    let engine = Engine::new(provider, store, config);
    engine.execute(
        &mut project,
        &run.mode,
        &run.input,
        RunIds {
            run_id: &run.id,
            trace_id: &run.trace_id,
        },
        &sink,
    )
}
