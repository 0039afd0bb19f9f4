//! Child-process spawning and time-bound execution.
//!
//! Grounded on `shell::process::exec_command` in the teacher: capture both
//! streams concurrently to avoid pipe deadlock, wrap the wait in a
//! `tokio::time::timeout`, and always reap the child before returning.
//!
//! Unlike the teacher's single-timeout behavior (which relies on
//! `kill_on_drop` once the `timeout` future is dropped), the gateway needs
//! `killed` to become `true` the instant the deadline fires — the scheduler
//! counts the request as timed out immediately, it does not wait for the
//! process to actually exit. So the deadline path here sends `SIGTERM`, waits
//! up to 5 seconds, and escalates to `SIGKILL` on a background task while the
//! caller already has its answer.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Duration;

use crate::types::ExecutionResult;

/// Grace period between `SIGTERM` and `SIGKILL` once a deadline fires
/// (spec.md §4.1).
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Cap on captured bytes per stream. The downstream CLI's JSON payloads are
/// small; this only guards against a misbehaving child flooding a pipe.
const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// Environment variables the gateway unsets on the child so a nested agent
/// doesn't believe it's running inside another agent session.
const UNSET_VARS: [&str; 3] = [
    "CLAUDECODE",
    "CLAUDE_CODE_TASK_LIST_ID",
    "CLAUDE_CODE_ENTRYPOINT",
];

/// Spawns and time-bounds the downstream CLI. A trait so tests can substitute
/// a canned responder without spawning a real process — the same reason the
/// teacher's `SessionManager` takes the shell binary as a parameter rather
/// than hardcoding it.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, args: Vec<String>, timeout_ms: u64) -> Result<ExecutionResult, SpawnError>;
}

/// Spawn failure — surfaced to the caller rather than fabricated into a
/// result (spec.md §4.1's "Failure modes").
#[derive(Debug, Clone)]
pub struct SpawnError(pub String);

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to spawn process: {}", self.0)
    }
}

/// Production [`ProcessRunner`] that spawns the configured CLI binary.
pub struct ClaudeExecutor {
    /// Binary name resolved via `PATH` — default `claude`, overridable for
    /// testing or alternate deployments.
    binary: String,
}

impl ClaudeExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ProcessRunner for ClaudeExecutor {
    async fn run(&self, args: Vec<String>, timeout_ms: u64) -> Result<ExecutionResult, SpawnError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC", "1");
        for var in UNSET_VARS {
            cmd.env_remove(var);
        }

        let mut child = cmd.spawn().map_err(|e| SpawnError(e.to_string()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError("failed to take stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError("failed to take stderr pipe".to_string()))?;

        let deadline = Duration::from_millis(timeout_ms);
        match tokio::time::timeout(deadline, async {
            let (stdout_data, stderr_data) = tokio::join!(
                read_capped(&mut stdout, MAX_OUTPUT_BYTES),
                read_capped(&mut stderr, MAX_OUTPUT_BYTES),
            );
            drop(stdout);
            drop(stderr);
            let status = child.wait().await;
            (status, stdout_data, stderr_data)
        })
        .await
        {
            Ok((status, stdout_data, stderr_data)) => {
                let status = status.map_err(|e| SpawnError(e.to_string()))?;
                Ok(ExecutionResult {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: stdout_data,
                    stderr: stderr_data,
                    killed: false,
                })
            }
            Err(_) => {
                kill_with_grace(child).await;
                Ok(ExecutionResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    killed: true,
                })
            }
        }
    }
}

/// Send `SIGTERM` immediately, then escalate to `SIGKILL` after
/// [`KILL_GRACE`] if the child is still alive. Runs detached — the caller
/// already has its `killed: true` result and does not wait for the reap.
async fn kill_with_grace(mut child: Child) {
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    tokio::spawn(async move {
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    });
}

/// Read from an async reader, keeping the first `max_bytes` and draining —
/// but discarding — the rest so the child never blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Build the CLI argument vector per spec.md §4.4.
pub fn build_args(
    prompt: &str,
    model: Option<&str>,
    system_prompt: Option<&str>,
    max_turns: u32,
    permission_mode: &str,
) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "json".to_string(),
        "--max-turns".to_string(),
        max_turns.to_string(),
        "--permission-mode".to_string(),
        permission_mode.to_string(),
    ];
    if let Some(model) = model.filter(|m| !m.is_empty()) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(system_prompt) = system_prompt {
        args.push("--system-prompt".to_string());
        args.push(system_prompt.to_string());
    }
    args
}

/// Environment overrides applied to every child (reserved for future use by
/// [`ProcessRunner`] implementors that need to inspect them).
#[allow(dead_code)]
pub fn env_overrides() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC".to_string(),
        "1".to_string(),
    );
    env
}
