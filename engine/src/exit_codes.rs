//! Stable exit codes for engine CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid store, config, arguments, or any error before a run starts.
pub const INVALID: i32 = 1;
/// The run executed and ended in the `failed` state.
pub const RUN_FAILED: i32 = 2;
