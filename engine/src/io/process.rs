//! Child process execution with a wall-clock timeout and bounded output.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of one provider invocation.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the output limit.
    pub stdout_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last few hundred characters of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let text = text.trim();
        let skip = text.chars().count().saturating_sub(400);
        text.chars().skip(skip).collect()
    }
}

/// Spawn `argv`, feed `stdin`, and collect stdout/stderr until exit or timeout.
///
/// Both pipes are drained on reader threads while the child runs, so a
/// chatty child cannot deadlock on a full pipe. At most `output_limit_bytes`
/// of each stream are kept.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str), timeout_secs = timeout.as_secs()))]
pub fn run_with_stdin(
    argv: &[String],
    stdin: &[u8],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    let Some((program, args)) = argv.split_first() else {
        bail!("command must be a non-empty array");
    };
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning provider process");
    let mut child = cmd.spawn().with_context(|| format!("spawn {program}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_reader = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading its input is reported through
        // its exit status, not as a write failure.
        if let Err(err) = child_stdin.write_all(stdin) {
            debug!(err = %err, "provider closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for provider")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "provider timed out, killing");
            timed_out = true;
            child.kill().context("kill provider")?;
            child.wait().context("wait provider after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_reader).context("join stdout")?;
    let (stderr, _) = join_reader(stderr_reader).context("join stderr")?;
    if stdout_truncated > 0 {
        warn!(stdout_truncated, "provider output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "provider finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let keep = n.min(room);
        kept.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
    Ok((kept, dropped))
}
