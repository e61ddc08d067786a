//! The vendor handler interface and shared query helpers

use crate::kill;
use crate::{AcceleratorDevice, AcceleratorProcess, Vendor};
use async_trait::async_trait;
use serve_core::{ExecutionTarget, LifecycleConfig};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// How processes are terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillPolicy {
    /// Maximum concurrent kill channels per host
    pub batch_size: usize,
    /// Wait between SIGTERM and SIGKILL
    pub grace: Duration,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            batch_size: 5,
            grace: Duration::from_secs(1),
        }
    }
}

impl From<&LifecycleConfig> for KillPolicy {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            batch_size: config.kill_batch_size,
            grace: config.kill_grace(),
        }
    }
}

/// Vendor-specific accelerator access.
///
/// Listing operations never fail: a tool error or unparseable output yields
/// an empty list.
#[async_trait]
pub trait AcceleratorHandler: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn kill_policy(&self) -> KillPolicy;

    /// Cheap capability probe
    async fn is_available(&self, host: &dyn ExecutionTarget) -> bool;

    async fn list_devices(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorDevice>;

    async fn list_processes(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorProcess>;

    async fn kill_process(&self, host: &dyn ExecutionTarget, pid: u32) -> bool {
        kill::terminate(host, pid, self.kill_policy().grace).await
    }

    /// Returns the pids that were terminated
    async fn kill_processes(&self, host: &dyn ExecutionTarget, pids: &[u32]) -> Vec<u32> {
        kill::terminate_all(host, pids, self.kill_policy()).await
    }
}

/// Run `command` and return stdout on success
pub(crate) async fn query(host: &dyn ExecutionTarget, vendor: Vendor, command: &str) -> Option<String> {
    let result = host.run(command).await;
    if result.success {
        Some(result.stdout)
    } else {
        debug!(
            host = %host.identity(),
            tool = vendor.tool(),
            exit_code = result.exit_code,
            "Accelerator query failed: {}",
            result.error_text().trim()
        );
        None
    }
}

/// Command listing full command lines for `pids`
pub fn ps_command(pids: &[u32]) -> String {
    let list: Vec<String> = pids.iter().map(u32::to_string).collect();
    format!("ps -o pid=,args= -p {} 2>/dev/null", list.join(","))
}

/// Parse `ps -o pid=,args=` output into pid → command line
pub fn parse_ps_args(output: &str) -> HashMap<u32, String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            Some((pid.parse().ok()?, args.trim().to_string()))
        })
        .collect()
}

/// Fill in `command` for processes whose tool only reported a name
pub async fn resolve_commands(host: &dyn ExecutionTarget, processes: &mut [AcceleratorProcess]) {
    let pids: Vec<u32> = processes
        .iter()
        .filter(|p| p.command.trim().is_empty())
        .map(|p| p.pid)
        .collect();
    if pids.is_empty() {
        return;
    }

    // ps exits 1 when some pids are already gone; take whatever it printed
    let result = host.run(&ps_command(&pids)).await;
    let commands = parse_ps_args(&result.stdout);
    for process in processes.iter_mut() {
        if let Some(command) = commands.get(&process.pid) {
            process.command = command.clone();
        }
    }
}

/// Parse a numeric field, tolerating `[N/A]`, units and blanks
pub(crate) fn parse_number(field: &str) -> Option<f64> {
    let cleaned: String = field
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse().ok()
}
