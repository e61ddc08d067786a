//! Core type definitions for servectl

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker appended to output that was cut at `max_output_bytes`
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Exit code reported when a command never reached a process
pub const NO_EXIT_CODE: i32 = -1;

/// Where a command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    /// The machine servectl itself runs on
    Local,
    /// A host reached over a remote shell
    Remote,
}

/// Identity of a reachable execution target.
///
/// The pool key (`host:port@username`) is derived from these fields and is
/// stable for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostIdentity {
    pub kind: HostKind,
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl HostIdentity {
    /// Identity of the local machine
    pub fn local() -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "local".to_string());

        Self {
            kind: HostKind::Local,
            host: "localhost".to_string(),
            port: 0,
            username,
        }
    }

    /// Identity of a remote host
    pub fn remote(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            kind: HostKind::Remote,
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    /// Pool/connection key: `host:port@username`
    pub fn key(&self) -> String {
        format!("{}:{}@{}", self.host, self.port, self.username)
    }

    pub fn is_local(&self) -> bool {
        self.kind == HostKind::Local
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Per-invocation execution options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Hard limit for this single invocation (no limit when `None`)
    pub timeout_ms: Option<u64>,

    /// Stdout/stderr are each truncated to this many bytes
    pub max_output_bytes: Option<usize>,

    /// Extra environment variables for the command
    pub env: Vec<(String, String)>,

    /// Working directory for the command
    pub working_dir: Option<String>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Apply `max_output_bytes` to a captured stream
    pub fn limit_output(&self, output: String) -> String {
        match self.max_output_bytes {
            Some(max) => truncate_output(output, max),
            None => output,
        }
    }
}

/// Outcome of a single command invocation.
///
/// Produced once per invocation. Decorators only add information
/// (`duration_ms`, `attempts`, `retried`, `timed_out`); they never flip
/// `success` of a result produced by the wrapped target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub retried: bool,
    pub timed_out: bool,
    pub attempts: u32,

    /// Transport-level failure (no remote exit status available)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Result of a command that ran to completion
    pub fn from_exit(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: exit_code == 0,
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_ms: 0,
            retried: false,
            timed_out: false,
            attempts: 1,
            error: None,
        }
    }

    /// Convenience for a successful run with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::from_exit(0, stdout, "")
    }

    /// Result of an invocation that never produced an exit status
    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            exit_code: NO_EXIT_CODE,
            stdout: String::new(),
            stderr: message.clone(),
            duration_ms: 0,
            retried: false,
            timed_out: false,
            attempts: 1,
            error: Some(message),
        }
    }

    /// Failure for a target that has no live connection
    pub fn not_connected(identity: &HostIdentity) -> Self {
        Self::failure(format!("Not connected to {}", identity))
    }

    /// Synthetic result for an invocation that exceeded its time budget
    pub fn timed_out(timeout_ms: u64) -> Self {
        let mut result = Self::failure(format!("Command timed out after {}ms", timeout_ms));
        result.timed_out = true;
        result.duration_ms = timeout_ms;
        result
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Best text describing a failure: transport error, then stderr, then stdout
    pub fn error_text(&self) -> &str {
        if let Some(error) = &self.error {
            return error;
        }
        if !self.stderr.trim().is_empty() {
            return &self.stderr;
        }
        &self.stdout
    }

    /// Non-empty, trimmed stdout lines
    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|line| !line.is_empty())
    }
}

/// Truncate `output` to at most `max_bytes` bytes on a char boundary
pub fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }

    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_MARKER);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key() {
        let identity = HostIdentity::remote("10.0.0.5", 2222, "ml");
        assert_eq!(identity.key(), "10.0.0.5:2222@ml");
        assert_eq!(identity.to_string(), "10.0.0.5:2222@ml");
        assert!(!identity.is_local());
        assert!(HostIdentity::local().is_local());
    }

    #[test]
    fn test_result_from_exit() {
        let ok = ExecutionResult::from_exit(0, "hello\n", "");
        assert!(ok.success);
        assert_eq!(ok.attempts, 1);

        let failed = ExecutionResult::from_exit(2, "", "boom");
        assert!(!failed.success);
        assert_eq!(failed.error_text(), "boom");
    }

    #[test]
    fn test_failure_and_timeout_results() {
        let identity = HostIdentity::remote("gpu-1", 22, "root");
        let result = ExecutionResult::not_connected(&identity);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert!(result.error_text().contains("gpu-1:22@root"));

        let timed_out = ExecutionResult::timed_out(50);
        assert!(timed_out.timed_out);
        assert!(!timed_out.success);
        assert!(timed_out.error_text().contains("timed out"));
    }

    #[test]
    fn test_truncate_output_respects_char_boundary() {
        let text = "héllo wörld".to_string();
        let truncated = truncate_output(text, 2);
        assert!(truncated.starts_with('h'));
        assert!(truncated.ends_with("[truncated]"));

        let short = truncate_output("abc".to_string(), 10);
        assert_eq!(short, "abc");
    }

    #[test]
    fn test_stdout_lines_skips_blanks() {
        let result = ExecutionResult::ok("a\n\n  b  \n");
        let lines: Vec<_> = result.stdout_lines().collect();
        assert_eq!(lines, vec!["a", "b"]);
    }
}
