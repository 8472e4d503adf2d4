//! Subprocess delegates speaking a JSON stdin/stdout protocol.
//!
//! # Protocol
//! - stdin:  the `DelegateRequest` as one JSON document, then EOF.
//! - stdout: a `StepResult` JSON document. Either the whole of stdout or its
//!   last non-empty line must parse; anything before that line is ignored.
//! - stderr: inherited, so worker log lines reach the operator's terminal.
//!
//! A non-zero exit with a parseable result is still a result (a test runner
//! reporting `failed` usually exits non-zero). Spawn errors, timeouts and
//! unparseable output are `DelegateUnavailable`.

use super::{Delegate, DelegateRequest};
use crate::error::{ConductorError, Result};
use crate::types::StepResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandDelegate {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: PathBuf,
    timeout: Option<Duration>,
}

impl CommandDelegate {
    pub fn new(program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: cwd.to_path_buf(),
            timeout: None,
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

#[async_trait]
impl Delegate for CommandDelegate {
    async fn invoke(&self, request: &DelegateRequest) -> Result<StepResult> {
        let unavailable = |reason: String| ConductorError::unavailable(&request.delegate, reason);
        let payload = serde_json::to_vec(request)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("CONDUCTOR_RUN", &request.run_id)
            .env("CONDUCTOR_STEP", request.key())
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        tracing::debug!(program = %self.program, step = %request.key(), "spawning delegate");
        let mut child = cmd
            .spawn()
            .map_err(|e| unavailable(format!("failed to spawn '{}': {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that exits without reading stdin is not an error by itself.
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(unavailable(format!("failed to write stdin: {e}")));
                }
            }
        }

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| unavailable(format!("timed out after {}s", limit.as_secs())))?,
            None => child.wait_with_output().await,
        };
        let output = waited.map_err(|e| unavailable(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_result(&stdout) {
            Some(result) => Ok(result),
            None if !output.status.success() => Err(unavailable(format!(
                "'{}' exited with {} and no result",
                self.program, output.status
            ))),
            None => {
                let hint = stdout.chars().take(200).collect::<String>();
                Err(unavailable(format!("unparseable result: {hint}")))
            }
        }
    }
}

fn parse_result(stdout: &str) -> Option<StepResult> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok().or_else(|| {
        trimmed
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .and_then(|l| serde_json::from_str(l).ok())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
