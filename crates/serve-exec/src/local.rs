//! Local execution target

use async_trait::async_trait;
use serve_core::types::NO_EXIT_CODE;
use serve_core::{Connection, ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Runs commands through the local shell (`sh -c`, or `cmd /C` on Windows).
///
/// The locale is pinned to `C` so parsed tool output does not vary with the
/// user's environment.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    identity: HostIdentity,
}

impl LocalTarget {
    pub fn new() -> Self {
        Self {
            identity: HostIdentity::local(),
        }
    }

    fn shell_command(command: &str) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }

    fn build_command(command: &str, options: &ExecOptions) -> Command {
        let mut cmd = Self::shell_command(command);
        cmd.env("LC_ALL", "C")
            .env("LANG", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Default for LocalTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionTarget for LocalTarget {
    fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    async fn execute(&self, command: &str, options: &ExecOptions) -> ExecutionResult {
        let started = Instant::now();
        debug!(command, "Executing local command");

        let child = match Self::build_command(command, options).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failure(format!("Failed to spawn process: {}", e))
                    .with_duration_ms(started.elapsed().as_millis() as u64);
            }
        };

        // The child is killed on drop, so an elapsed timeout reaps it
        let output = match options.timeout_ms {
            Some(timeout_ms) => {
                match timeout(Duration::from_millis(timeout_ms), child.wait_with_output()).await {
                    Ok(output) => output,
                    Err(_) => return ExecutionResult::timed_out(timeout_ms),
                }
            }
            None => child.wait_with_output().await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match output {
            Ok(output) => {
                let exit_code = output.status.code().unwrap_or(NO_EXIT_CODE);
                let stdout = options.limit_output(String::from_utf8_lossy(&output.stdout).into_owned());
                let stderr = options.limit_output(String::from_utf8_lossy(&output.stderr).into_owned());
                ExecutionResult::from_exit(exit_code, stdout, stderr).with_duration_ms(duration_ms)
            }
            Err(e) => ExecutionResult::failure(format!("Failed to wait for process: {}", e))
                .with_duration_ms(duration_ms),
        }
    }
}

#[async_trait]
impl Connection for LocalTarget {
    async fn connect(&self) -> serve_core::Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn disconnect(&self) -> serve_core::Result<()> {
        Ok(())
    }
}
