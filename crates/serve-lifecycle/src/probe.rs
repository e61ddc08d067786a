//! Port, process-table and file probes over the shell

use regex::Regex;
use serve_core::{ExecutionResult, ExecutionTarget};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::debug;

pub const PROCESS_TABLE: &str = "ps -eo pid=,ppid=,args=";

pub const LISTENING_PORTS: &str = "(ss -ltnH 2>/dev/null || netstat -ltn 2>/dev/null)";

static SS_PID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"pid=(\d+)").expect("valid regex"));

/// One row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub args: String,
}

pub fn parse_process_table(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, rest) = line.trim().split_once(char::is_whitespace)?;
            let rest = rest.trim_start();
            let (ppid, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            Some(ProcessInfo {
                pid: pid.parse().ok()?,
                ppid: ppid.parse().ok()?,
                args: args.trim().to_string(),
            })
        })
        .collect()
}

pub async fn process_table(host: &dyn ExecutionTarget) -> Vec<ProcessInfo> {
    let result = host.run(PROCESS_TABLE).await;
    if !result.success {
        debug!(host = %host.identity(), error = result.error_text(), "Process table unavailable");
        return Vec::new();
    }
    parse_process_table(&result.stdout)
}

/// Local ports from `ss -ltnH` or `netstat -ltn`; the local address is the
/// fourth column in both
pub fn parse_listening_ports(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|addr| addr.rsplit(':').next())
        .filter_map(|port| port.parse().ok())
        .collect()
}

pub async fn listening_ports(host: &dyn ExecutionTarget) -> BTreeSet<u16> {
    parse_listening_ports(&host.run(LISTENING_PORTS).await.stdout)
}

pub async fn is_port_listening(host: &dyn ExecutionTarget, port: u16) -> bool {
    listening_ports(host).await.contains(&port)
}

pub fn port_owner_command(port: u16) -> String {
    format!(
        "ss -ltnpH 'sport = :{port}' 2>/dev/null; lsof -t -iTCP:{port} -sTCP:LISTEN 2>/dev/null",
        port = port
    )
}

/// Pids from `ss -p` (`users:(("python",pid=42,fd=3))`) and `lsof -t`
pub fn parse_port_owners(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let found: Vec<u32> = if !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()) {
            line.parse().ok().into_iter().collect()
        } else {
            SS_PID
                .captures_iter(line)
                .filter_map(|caps| caps[1].parse().ok())
                .collect()
        };
        for pid in found {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

pub async fn port_owners(host: &dyn ExecutionTarget, port: u16) -> Vec<u32> {
    parse_port_owners(&host.run(&port_owner_command(port)).await.stdout)
}

/// Single-quote for `sh`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a path, leaving a leading `~/` for the shell to expand
pub fn shell_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None if path == "~" => "\"$HOME\"".to_string(),
        None => shell_quote(path),
    }
}

/// Directory part of `path`, if it has one
pub fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&trimmed[..index]),
        None => None,
    }
}

pub async fn ensure_dir(host: &dyn ExecutionTarget, dir: &str) -> ExecutionResult {
    host.run(&format!("mkdir -p {}", shell_path(dir))).await
}

pub fn tail_command(path: &str, lines: usize) -> String {
    format!("tail -n {} {} 2>/dev/null", lines, shell_path(path))
}

/// Last `lines` lines of `path`, empty when the file cannot be read
pub async fn tail_file(host: &dyn ExecutionTarget, path: &str, lines: usize) -> String {
    host.run(&tail_command(path, lines)).await.stdout
}
