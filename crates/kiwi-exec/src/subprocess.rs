// SPDX-License-Identifier: MIT OR Apache-2.0
//! The subprocess primitive.

use kiwi_core::expand::{expand_env, param_env_key};
use kiwi_error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Default wall-clock limit for a spawned process, in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 300.0;

/// Subprocess execution config, deserialized from a merged chain config.
#[derive(Debug, Clone, Deserialize)]
pub struct SubprocessConfig {
    /// Program to invoke.
    pub command: String,
    /// Literal argument vector.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment, merged over the process env after `${VAR}`
    /// expansion of each value.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Seconds before the child is killed.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Capture stdout/stderr (true) or inherit them (false).
    #[serde(default = "default_true")]
    pub capture_output: bool,
    /// Data written to the child's stdin.
    #[serde(default)]
    pub input_data: Option<String>,
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl SubprocessConfig {
    /// Build from a merged chain config map.
    pub fn from_config(config: &Map<String, Value>) -> KernelResult<Self> {
        serde_json::from_value(Value::Object(config.clone())).map_err(|e| {
            KernelError::execution_failed(format!("invalid subprocess config: {e}"))
        })
    }
}

/// Result of one subprocess execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessOutput {
    /// `return_code == 0`.
    pub success: bool,
    /// Captured stdout (empty when `capture_output` is off).
    pub stdout: String,
    /// Captured stderr, or the spawn failure cause.
    pub stderr: String,
    /// Child exit code; `-1` when the process never ran or died to a signal.
    pub return_code: i32,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// Run a process to completion.
///
/// Runtime `params` are injected as `KIWI_PARAM_<UPPER>` environment
/// variables so child code reads them uniformly. Spawn failures (unknown
/// command, permission) come back as failure *results*; only the timeout
/// crosses as a `resource_limit` error.
pub async fn execute(
    config: &SubprocessConfig,
    params: &BTreeMap<String, Value>,
) -> KernelResult<SubprocessOutput> {
    let command = expand_env(&config.command);
    let start = Instant::now();

    let mut cmd = Command::new(&command);
    cmd.args(config.args.iter().map(|a| expand_env(a)));
    cmd.kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, expand_env(value));
    }
    for (name, value) in params {
        cmd.env(param_env_key(name), value_to_env(value));
    }
    if let Some(cwd) = &config.cwd {
        cmd.current_dir(expand_env(cwd));
    }

    if config.capture_output {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    cmd.stdin(if config.input_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let cause = match e.kind() {
                std::io::ErrorKind::NotFound => format!("command not found: {command}"),
                std::io::ErrorKind::PermissionDenied => {
                    format!("permission denied spawning: {command}")
                }
                _ => format!("failed to spawn '{command}': {e}"),
            };
            return Ok(SubprocessOutput {
                success: false,
                stdout: String::new(),
                stderr: cause,
                return_code: -1,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
    };

    if let Some(input) = &config.input_data {
        if let Some(mut stdin) = child.stdin.take() {
            // A child that closes stdin early is not an error.
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
    }

    let deadline = Duration::from_secs_f64(config.timeout.max(0.001));
    let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Ok(SubprocessOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("failed to collect output of '{command}': {e}"),
                return_code: -1,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
        Err(_elapsed) => {
            // Dropping the wait future reaps the child via kill_on_drop.
            let duration_ms = start.elapsed().as_millis() as u64;
            return Err(KernelError::resource_limit(format!(
                "subprocess '{command}' exceeded its {:.0}s timeout",
                config.timeout
            ))
            .with_context("timeout_secs", config.timeout)
            .with_context("duration_ms", duration_ms as i64)
            .with_suggestion("raise `timeout` in the tool config or reduce the workload"));
        }
    };

    let return_code = output.status.code().unwrap_or(-1);
    debug!(target: "kiwi.exec.subprocess", %command, return_code, "process finished");

    Ok(SubprocessOutput {
        success: return_code == 0,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        return_code,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn value_to_env(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
