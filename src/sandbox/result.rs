/// Code execution result model
///
/// The verdict/timing/output record produced once per execution of a piece
/// action or inline script. Results are immutable once built.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Classification of one execution's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Ok,
    RuntimeError,
    Timeout,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Ok => "OK",
            Verdict::RuntimeError => "RUNTIME_ERROR",
            Verdict::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Immutable record of a single code execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionResult {
    verdict: Verdict,
    /// Wall-clock duration in seconds
    duration_secs: f64,
    stdout: String,
    stderr: String,
    /// Present only when the verdict is OK
    output: Option<Value>,
}

impl CodeExecutionResult {
    pub fn ok(duration: Duration, stdout: String, stderr: String, output: Value) -> Self {
        Self {
            verdict: Verdict::Ok,
            duration_secs: duration.as_secs_f64(),
            stdout,
            stderr,
            output: Some(output),
        }
    }

    /// Error text goes to stderr after whatever the code itself wrote there
    pub fn runtime_error(duration: Duration, stdout: String, stderr: String) -> Self {
        Self {
            verdict: Verdict::RuntimeError,
            duration_secs: duration.as_secs_f64(),
            stdout,
            stderr,
            output: None,
        }
    }

    pub fn timeout(duration: Duration, stdout: String, stderr: String) -> Self {
        Self {
            verdict: Verdict::Timeout,
            duration_secs: duration.as_secs_f64(),
            stdout,
            stderr,
            output: None,
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn is_ok(&self) -> bool {
        self.verdict == Verdict::Ok
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }
}

/// Marker appended when captured output hits its cap
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Append-only text buffer that stops growing at a byte limit
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append as much of `chunk` as fits, cutting on a char boundary
    pub fn push_str(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }

        let mut cut = room;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.truncated = true;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        if self.truncated {
            format!("{}{}", self.text, TRUNCATION_MARKER)
        } else {
            self.text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_ok_results_carry_output() {
        let ok = CodeExecutionResult::ok(Duration::from_millis(1500), String::new(), String::new(), json!(1));
        assert!(ok.is_ok());
        assert_eq!(ok.output(), Some(&json!(1)));
        assert!((ok.duration_secs() - 1.5).abs() < f64::EPSILON);

        let failed = CodeExecutionResult::runtime_error(Duration::ZERO, String::new(), "boom".into());
        assert_eq!(failed.verdict(), Verdict::RuntimeError);
        assert_eq!(failed.output(), None);
        assert_eq!(failed.stderr(), "boom");
    }

    #[test]
    fn verdict_serializes_in_screaming_case() {
        assert_eq!(serde_json::to_value(Verdict::RuntimeError).unwrap(), json!("RUNTIME_ERROR"));
        assert_eq!(Verdict::Timeout.to_string(), "TIMEOUT");
    }

    #[test]
    fn capped_buffer_cuts_on_char_boundary() {
        let mut buffer = CappedBuffer::new(5);
        buffer.push_str("abc");
        buffer.push_str("déf");
        assert!(buffer.is_truncated());
        buffer.push_str("ignored");
        // "abc" + "d" fits, the two-byte 'é' would cross the limit
        assert_eq!(buffer.into_string(), format!("abcd{}", TRUNCATION_MARKER));
    }

    #[test]
    fn capped_buffer_under_limit_is_untouched() {
        let mut buffer = CappedBuffer::new(64);
        buffer.push_str("hello\n");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.into_string(), "hello\n");
    }
}
