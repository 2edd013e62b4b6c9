/// Lua execution engine behind every sandbox
///
/// Each execution gets a fresh `mlua::Lua` VM, either in a killable child
/// process (`Isolation::Process`, see `runner`) or on tokio's blocking pool
/// (`Isolation::Thread`). The VM is stripped of filesystem/process globals,
/// memory-limited, and carries an instruction hook that aborts it once the
/// caller's deadline passes. The hook cannot reach into Lua's C functions, so
/// only process isolation can stop a pattern match that runs past its deadline;
/// on a thread such a VM is abandoned after the grace period.
///
/// Script contract: the chunk sees a global `input` (the JSON input converted
/// to Lua) and its return value becomes the execution output. `print` writes to
/// captured stdout, `warn` to captured stderr, and `sleep(ms)` blocks while
/// still honouring the deadline.

use crate::sandbox::result::{CappedBuffer, CodeExecutionResult};
use crate::sandbox::runner::{self, ChunkOutcome, ChunkReport, ChunkRequest};
use mlua::{HookTriggers, LuaSerdeExt, VmState};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Deadline is checked every this many VM instructions
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

/// Longest single nap inside the `sleep` builtin between deadline checks
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Tables nested deeper than this cannot be converted to JSON (cycles end up here)
const MAX_OUTPUT_DEPTH: usize = 64;

/// Globals removed from every VM before user code runs
const BLOCKED_GLOBALS: [&str; 9] = [
    "os",
    "io",
    "debug",
    "package",
    "require",
    "dofile",
    "loadfile",
    "load",
    "collectgarbage",
];

pub(crate) const TIMEOUT_MESSAGE: &str = "execution timed out";

/// Where a VM runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Blocking-pool thread inside the worker process
    Thread,
    /// Child process of `program` started in runner mode, killed on timeout
    Process { program: PathBuf },
}

/// Per-execution resource limits
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// Caller-supplied wall-clock timeout
    pub timeout: Duration,
    /// How long a timed-out VM may take to stop before it is abandoned
    pub grace: Duration,
    /// Cap on captured stdout and stderr, each
    pub output_limit_bytes: usize,
    /// Lua allocator limit
    pub memory_limit_bytes: usize,
    pub isolation: Isolation,
}

/// Count of Lua VMs currently running on blocking threads
///
/// Shared between a sandbox and its executions so callers can verify that a
/// timed-out execution really stopped.
#[derive(Debug, Clone, Default)]
pub struct RunningExecutions(Arc<AtomicUsize>);

impl RunningExecutions {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn enter(&self) -> RunningGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        RunningGuard(Arc::clone(&self.0))
    }
}

/// Decrements the running count when the VM thread or runner process is gone
pub(crate) struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared between the controlling task and the VM thread
#[derive(Clone)]
struct VmControl {
    deadline: Instant,
    /// Set by the controller when the outer guard gives up waiting
    cancelled: Arc<AtomicBool>,
    /// Set by the VM side when it stopped because of the deadline
    timed_out: Arc<AtomicBool>,
    stdout: Arc<Mutex<CappedBuffer>>,
    stderr: Arc<Mutex<CappedBuffer>>,
    memory_limit_bytes: usize,
}

impl VmControl {
    fn new(deadline: Instant, output_limit_bytes: usize, memory_limit_bytes: usize) -> Self {
        Self {
            deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
            timed_out: Arc::new(AtomicBool::new(false)),
            stdout: Arc::new(Mutex::new(CappedBuffer::new(output_limit_bytes))),
            stderr: Arc::new(Mutex::new(CappedBuffer::new(output_limit_bytes))),
            memory_limit_bytes,
        }
    }

    /// True once the deadline passed or the controller cancelled; records the timeout
    fn expired(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) || Instant::now() >= self.deadline {
            self.timed_out.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

/// Run one Lua chunk under `limits` and classify the outcome
///
/// Never returns an error: compile errors, runtime errors, panics and timeouts
/// all become a `CodeExecutionResult`.
pub async fn run_chunk(
    chunk_name: &str,
    source: &str,
    input: &Value,
    limits: &ExecutionLimits,
    running: &RunningExecutions,
) -> CodeExecutionResult {
    match &limits.isolation {
        Isolation::Process { program } => runner::run_in_child(program, chunk_name, source, input, limits, running).await,
        Isolation::Thread => run_on_thread(chunk_name, source, input, limits, running).await,
    }
}

/// Evaluate a runner request in the current thread (runner child side)
pub(crate) fn evaluate_request(request: &ChunkRequest) -> ChunkReport {
    let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
    let control = VmControl::new(deadline, request.output_limit_bytes, request.memory_limit_bytes);

    let result = evaluate(&control, &request.name, &request.source, &request.input);
    let outcome = match result {
        _ if control.timed_out.load(Ordering::SeqCst) => {
            append(&control.stderr, TIMEOUT_MESSAGE);
            ChunkOutcome::Timeout
        }
        Ok(output) => ChunkOutcome::Ok { output },
        Err(message) => {
            append(&control.stderr, &message);
            ChunkOutcome::Error { message }
        }
    };

    ChunkReport {
        outcome,
        stdout: drain(&control.stdout),
        stderr: drain(&control.stderr),
    }
}

async fn run_on_thread(
    chunk_name: &str,
    source: &str,
    input: &Value,
    limits: &ExecutionLimits,
    running: &RunningExecutions,
) -> CodeExecutionResult {
    let started = Instant::now();
    let control = VmControl::new(started + limits.timeout, limits.output_limit_bytes, limits.memory_limit_bytes);

    let guard = running.enter();
    let vm_control = control.clone();
    let name = chunk_name.to_string();
    let code = source.to_string();
    let vm_input = input.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        evaluate(&vm_control, &name, &code, &vm_input)
    });

    let outcome = tokio::time::timeout(limits.timeout + limits.grace, handle).await;
    let duration = started.elapsed();

    match outcome {
        Err(_) => {
            control.cancelled.store(true, Ordering::SeqCst);
            tracing::error!(
                "⛔ Execution '{}' did not stop within {:?} of its deadline, abandoning VM thread",
                chunk_name,
                limits.grace
            );
            append(&control.stderr, TIMEOUT_MESSAGE);
            CodeExecutionResult::timeout(duration, drain(&control.stdout), drain(&control.stderr))
        }
        Ok(Err(join_error)) => {
            tracing::error!("❌ Sandbox thread for '{}' failed: {}", chunk_name, join_error);
            append(&control.stderr, &format!("sandbox thread failed: {}", join_error));
            CodeExecutionResult::runtime_error(duration, drain(&control.stdout), drain(&control.stderr))
        }
        Ok(Ok(_)) if control.timed_out.load(Ordering::SeqCst) => {
            tracing::warn!("⏰ Execution '{}' timed out after {:?}", chunk_name, duration);
            append(&control.stderr, TIMEOUT_MESSAGE);
            CodeExecutionResult::timeout(duration, drain(&control.stdout), drain(&control.stderr))
        }
        Ok(Ok(Ok(output))) => {
            tracing::debug!("✅ Execution '{}' completed in {:?}", chunk_name, duration);
            CodeExecutionResult::ok(duration, drain(&control.stdout), drain(&control.stderr), output)
        }
        Ok(Ok(Err(message))) => {
            tracing::debug!("💥 Execution '{}' raised: {}", chunk_name, message);
            append(&control.stderr, &message);
            CodeExecutionResult::runtime_error(duration, drain(&control.stdout), drain(&control.stderr))
        }
    }
}

/// Build a hardened VM, run the chunk and convert its return value (blocking)
fn evaluate(control: &VmControl, name: &str, source: &str, input: &Value) -> Result<Value, String> {
    let lua = mlua::Lua::new();
    let globals = lua.globals();

    lua.set_memory_limit(control.memory_limit_bytes)
        .map_err(|e| format!("failed to apply memory limit: {}", e))?;

    for blocked in BLOCKED_GLOBALS {
        globals
            .set(blocked, mlua::Nil)
            .map_err(|e| format!("failed to remove global '{}': {}", blocked, e))?;
    }

    let stdout = Arc::clone(&control.stdout);
    let print = lua
        .create_function(move |_, args: mlua::Variadic<mlua::Value>| {
            append(&stdout, &format!("{}\n", join_lua_values(&args)));
            Ok(())
        })
        .map_err(|e| format!("failed to create print: {}", e))?;
    globals.set("print", print).map_err(|e| format!("failed to set print: {}", e))?;

    let stderr = Arc::clone(&control.stderr);
    let warn = lua
        .create_function(move |_, args: mlua::Variadic<mlua::Value>| {
            append(&stderr, &format!("{}\n", join_lua_values(&args)));
            Ok(())
        })
        .map_err(|e| format!("failed to create warn: {}", e))?;
    globals.set("warn", warn).map_err(|e| format!("failed to set warn: {}", e))?;

    let sleep_control = control.clone();
    let sleep = lua
        .create_function(move |_, millis: f64| {
            let wake = Instant::now() + Duration::from_secs_f64(millis.max(0.0) / 1000.0);
            loop {
                if sleep_control.expired() {
                    return Err(mlua::Error::RuntimeError(TIMEOUT_MESSAGE.to_string()));
                }
                let now = Instant::now();
                if now >= wake {
                    return Ok(());
                }
                let until = wake.min(sleep_control.deadline);
                std::thread::sleep(until.saturating_duration_since(now).min(SLEEP_SLICE));
            }
        })
        .map_err(|e| format!("failed to create sleep: {}", e))?;
    globals.set("sleep", sleep).map_err(|e| format!("failed to set sleep: {}", e))?;

    let hook_control = control.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if hook_control.expired() {
                Err(mlua::Error::RuntimeError(TIMEOUT_MESSAGE.to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    )
    .map_err(|e| format!("failed to install deadline hook: {}", e))?;

    let lua_input = lua
        .to_value(input)
        .map_err(|e| format!("failed to convert input: {}", e))?;
    globals.set("input", lua_input).map_err(|e| format!("failed to set input: {}", e))?;

    let result: mlua::Value = lua
        .load(source)
        .set_name(name)
        .eval()
        .map_err(|e| e.to_string())?;

    lua_to_json(result, 0)
}

/// Convert a Lua value to JSON
///
/// Tables with keys 1..n and nothing else become arrays, everything else
/// becomes an object. Functions, userdata and threads become null.
fn lua_to_json(lua_value: mlua::Value, depth: usize) -> Result<Value, String> {
    if depth > MAX_OUTPUT_DEPTH {
        return Err(format!("output nested deeper than {} levels", MAX_OUTPUT_DEPTH));
    }

    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        mlua::Value::String(s) => {
            let text = s.to_str().map_err(|e| format!("invalid UTF-8 in Lua string: {}", e))?;
            Ok(Value::String(text.to_string()))
        }
        mlua::Value::Table(table) => {
            let mut is_array = true;
            let mut max_index = 0usize;
            let mut count = 0usize;

            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| format!("failed to iterate Lua table: {}", e))?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut items = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    let item: mlua::Value = table
                        .get(i)
                        .map_err(|e| format!("failed to read Lua table: {}", e))?;
                    items.push(lua_to_json(item, depth + 1)?);
                }
                return Ok(Value::Array(items));
            }

            let mut object = serde_json::Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, value) = pair.map_err(|e| format!("failed to iterate Lua table: {}", e))?;
                let key = match key {
                    mlua::Value::String(s) => s
                        .to_str()
                        .map_err(|e| format!("invalid UTF-8 in Lua key: {}", e))?
                        .to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    _ => continue,
                };
                object.insert(key, lua_to_json(value, depth + 1)?);
            }
            Ok(Value::Object(object))
        }
        _ => Ok(Value::Null),
    }
}

/// Render `print`/`warn` arguments the way Lua's own print does (tab-separated)
fn join_lua_values(values: &[mlua::Value]) -> String {
    values
        .iter()
        .map(|value| match value {
            mlua::Value::Nil => "nil".to_string(),
            mlua::Value::Boolean(b) => b.to_string(),
            mlua::Value::Integer(i) => i.to_string(),
            mlua::Value::Number(n) => n.to_string(),
            mlua::Value::String(s) => s.to_string_lossy().to_string(),
            other => other.type_name().to_string(),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

fn append(buffer: &Mutex<CappedBuffer>, text: &str) {
    let mut guard = buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.push_str(text);
}

fn drain(buffer: &Mutex<CappedBuffer>) -> String {
    let mut guard = buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let limit = guard.limit();
    std::mem::replace(&mut *guard, CappedBuffer::new(limit)).into_string()
}
