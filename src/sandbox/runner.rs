/// Out-of-process chunk runner
///
/// With process isolation every execution runs in a child copy of the worker
/// binary started with `--run-chunk`. The child reads one `ChunkRequest` as
/// JSON on stdin, evaluates it under the same VM hardening as the in-thread
/// path and writes one `ChunkReport` on stdout. The parent owns the child: an
/// execution still alive at `timeout + grace` is killed and reaped, which also
/// stops Lua C functions (pattern matching, `string.rep`) that never reach the
/// instruction hook.

use crate::sandbox::lua::{self, ExecutionLimits, RunningExecutions, TIMEOUT_MESSAGE};
use crate::sandbox::result::{CappedBuffer, CodeExecutionResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// First argument that switches the worker binary into runner mode
pub const RUN_CHUNK_ARG: &str = "--run-chunk";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChunkRequest {
    pub name: String,
    pub source: String,
    pub input: Value,
    pub timeout_ms: u64,
    pub output_limit_bytes: usize,
    pub memory_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub(crate) enum ChunkOutcome {
    Ok { output: Value },
    Error { message: String },
    Timeout,
}

/// What one VM run produced; captured output is already capped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ChunkReport {
    #[serde(flatten)]
    pub outcome: ChunkOutcome,
    pub stdout: String,
    pub stderr: String,
}

impl ChunkReport {
    pub(crate) fn into_result(self, duration: Duration) -> CodeExecutionResult {
        match self.outcome {
            ChunkOutcome::Ok { output } => CodeExecutionResult::ok(duration, self.stdout, self.stderr, output),
            ChunkOutcome::Error { .. } => CodeExecutionResult::runtime_error(duration, self.stdout, self.stderr),
            ChunkOutcome::Timeout => CodeExecutionResult::timeout(duration, self.stdout, self.stderr),
        }
    }
}

/// Child side: evaluate the request on stdin and answer on stdout (blocking)
pub fn serve_stdio() -> std::io::Result<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    let request: ChunkRequest =
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let report = lua::evaluate_request(&request);

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &report).map_err(std::io::Error::other)?;
    stdout.flush()
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut bytes = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut bytes).await {
            tracing::debug!("Runner pipe closed early: {}", e);
        }
    }
    bytes
}

fn capped(bytes: &[u8], limit: usize) -> String {
    let mut buffer = CappedBuffer::new(limit);
    buffer.push_str(String::from_utf8_lossy(bytes).trim_end());
    buffer.into_string()
}

/// Parent side: run one chunk in a child process and classify the outcome
pub(crate) async fn run_in_child(
    program: &Path,
    chunk_name: &str,
    source: &str,
    input: &Value,
    limits: &ExecutionLimits,
    running: &RunningExecutions,
) -> CodeExecutionResult {
    let started = Instant::now();
    let _running = running.enter();

    let request = ChunkRequest {
        name: chunk_name.to_string(),
        source: source.to_string(),
        input: input.clone(),
        timeout_ms: u64::try_from(limits.timeout.as_millis()).unwrap_or(u64::MAX),
        output_limit_bytes: limits.output_limit_bytes,
        memory_limit_bytes: limits.memory_limit_bytes,
    };
    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(e) => {
            return CodeExecutionResult::runtime_error(
                started.elapsed(),
                String::new(),
                format!("failed to encode sandbox request: {}", e),
            )
        }
    };

    let spawned = Command::new(program)
        .arg(RUN_CHUNK_ARG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("❌ Failed to start sandbox runner {}: {}", program.display(), e);
            return CodeExecutionResult::runtime_error(
                started.elapsed(),
                String::new(),
                format!("failed to start sandbox runner: {}", e),
            );
        }
    };

    let stdin = child.stdin.take();
    let writer = tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }
        Ok::<(), std::io::Error>(())
    });
    let reader = tokio::spawn(read_all(child.stdout.take()));
    let diagnostics = tokio::spawn(read_all(child.stderr.take()));

    let waited = tokio::time::timeout(limits.timeout + limits.grace, child.wait()).await;
    let duration = started.elapsed();

    let status = match waited {
        Err(_) => {
            tracing::error!(
                "⛔ Execution '{}' did not stop within {:?} of its deadline, killing runner",
                chunk_name,
                limits.grace
            );
            if let Err(e) = child.kill().await {
                tracing::warn!("⚠️ Failed to kill runner for '{}': {}", chunk_name, e);
            }
            writer.abort();
            reader.abort();
            diagnostics.abort();
            return CodeExecutionResult::timeout(duration, String::new(), TIMEOUT_MESSAGE.to_string());
        }
        Ok(Err(e)) => {
            tracing::error!("❌ Lost sandbox runner for '{}': {}", chunk_name, e);
            return CodeExecutionResult::runtime_error(duration, String::new(), format!("sandbox runner failed: {}", e));
        }
        Ok(Ok(status)) => status,
    };

    if let Ok(Err(e)) = writer.await {
        tracing::debug!("Runner for '{}' stopped reading its request: {}", chunk_name, e);
    }
    let stdout = reader.await.unwrap_or_default();
    let stderr = diagnostics.await.unwrap_or_default();

    match serde_json::from_slice::<ChunkReport>(&stdout) {
        Ok(report) if status.success() => {
            tracing::debug!("✅ Runner for '{}' finished in {:?}", chunk_name, duration);
            report.into_result(duration)
        }
        _ => {
            tracing::error!("💥 Sandbox runner for '{}' exited with {}", chunk_name, status);
            let detail = capped(&stderr, limits.output_limit_bytes);
            CodeExecutionResult::runtime_error(
                duration,
                String::new(),
                format!("sandbox runner exited with {}: {}", status, detail),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_wire_format_is_flat() {
        let report = ChunkReport {
            outcome: ChunkOutcome::Ok { output: json!({ "n": 1 }) },
            stdout: "hi\n".into(),
            stderr: String::new(),
        };
        let encoded = serde_json::to_value(&report).unwrap();
        assert_eq!(encoded, json!({ "outcome": "ok", "output": { "n": 1 }, "stdout": "hi\n", "stderr": "" }));

        let timeout: ChunkReport =
            serde_json::from_value(json!({ "outcome": "timeout", "stdout": "", "stderr": "execution timed out" })).unwrap();
        assert_eq!(timeout.outcome, ChunkOutcome::Timeout);
    }

    #[tokio::test]
    async fn missing_runner_is_a_runtime_error() {
        let limits = ExecutionLimits {
            timeout: Duration::from_secs(1),
            grace: Duration::from_millis(100),
            output_limit_bytes: 1024,
            memory_limit_bytes: 8 * 1024 * 1024,
            isolation: lua::Isolation::Thread,
        };
        let running = RunningExecutions::default();
        let result = run_in_child(
            Path::new("/nonexistent/piecework-runner"),
            "inline",
            "return 1",
            &json!({}),
            &limits,
            &running,
        )
        .await;

        assert_eq!(result.verdict(), crate::sandbox::result::Verdict::RuntimeError);
        assert!(result.stderr().contains("failed to start sandbox runner"));
        assert_eq!(running.count(), 0);
    }
}
