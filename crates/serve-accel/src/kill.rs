//! Signal delivery over the shell
//!
//! Killing a pid is vendor-neutral; handlers and the lifecycle manager share
//! these helpers.

use crate::KillPolicy;
use serve_core::ExecutionTarget;
use std::time::Duration;
use tracing::{debug, warn};

/// Signals sent with `kill`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
    /// Existence probe (`kill -0`)
    Probe,
}

impl Signal {
    fn flag(self) -> &'static str {
        match self {
            Signal::Term => "-TERM",
            Signal::Kill => "-KILL",
            Signal::Probe => "-0",
        }
    }
}

/// Shell command delivering `signal` to `pid`; prints `ok` on success
pub fn kill_command(pid: u32, signal: Signal) -> String {
    format!("kill {} {} 2>/dev/null && echo ok", signal.flag(), pid)
}

pub async fn send_signal(host: &dyn ExecutionTarget, pid: u32, signal: Signal) -> bool {
    let result = host.run(&kill_command(pid, signal)).await;
    result.success && result.stdout.trim() == "ok"
}

pub async fn is_alive(host: &dyn ExecutionTarget, pid: u32) -> bool {
    send_signal(host, pid, Signal::Probe).await
}

/// SIGTERM, wait `grace`, then SIGKILL if the process survived.
///
/// Returns true when the process was signalled and is gone afterwards.
/// A pid that does not exist (or cannot be signalled) returns false.
pub async fn terminate(host: &dyn ExecutionTarget, pid: u32, grace: Duration) -> bool {
    if pid <= 1 {
        warn!(pid, "Refusing to signal init or the kernel");
        return false;
    }

    if !send_signal(host, pid, Signal::Term).await {
        debug!(host = %host.identity(), pid, "Process not signalled, already gone or not permitted");
        return false;
    }

    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }

    if is_alive(host, pid).await {
        debug!(host = %host.identity(), pid, "Process survived SIGTERM, sending SIGKILL");
        send_signal(host, pid, Signal::Kill).await;
        return !is_alive(host, pid).await;
    }
    true
}

/// Terminate `pids` in groups of `policy.batch_size` concurrent channels.
///
/// Returns the pids that were terminated, in input order.
pub async fn terminate_all(host: &dyn ExecutionTarget, pids: &[u32], policy: KillPolicy) -> Vec<u32> {
    let mut unique: Vec<u32> = Vec::with_capacity(pids.len());
    for pid in pids {
        if !unique.contains(pid) {
            unique.push(*pid);
        }
    }

    let mut killed = Vec::new();
    for batch in unique.chunks(policy.batch_size.max(1)) {
        let outcomes = futures::future::join_all(
            batch
                .iter()
                .map(|&pid| async move { (pid, terminate(host, pid, policy.grace).await) }),
        )
        .await;

        killed.extend(outcomes.into_iter().filter(|(_, gone)| *gone).map(|(pid, _)| pid));
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_core::ExecutionResult;
    use serve_dev::ScriptedTarget;
    use std::time::Instant;

    fn policy(batch_size: usize) -> KillPolicy {
        KillPolicy {
            batch_size,
            grace: Duration::ZERO,
        }
    }

    #[test]
    fn test_kill_command() {
        assert_eq!(kill_command(123, Signal::Term), "kill -TERM 123 2>/dev/null && echo ok");
        assert_eq!(kill_command(7, Signal::Probe), "kill -0 7 2>/dev/null && echo ok");
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let host = ScriptedTarget::new()
            .on("kill -TERM", ExecutionResult::ok("ok\n"))
            .on_sequence(
                "kill -0",
                vec![ExecutionResult::ok("ok\n"), ExecutionResult::from_exit(1, "", "")],
            )
            .on("kill -KILL", ExecutionResult::ok("ok\n"));

        assert!(terminate(&host, 4242, Duration::ZERO).await);
        assert_eq!(host.calls_matching("kill -KILL 4242"), 1);
    }

    #[tokio::test]
    async fn test_terminate_missing_process() {
        let host = ScriptedTarget::new().on("kill -TERM", ExecutionResult::from_exit(1, "", ""));

        assert!(!terminate(&host, 4242, Duration::ZERO).await);
        assert_eq!(host.calls_matching("kill -0"), 0);
    }

    #[tokio::test]
    async fn test_terminate_refuses_init() {
        let host = ScriptedTarget::new();
        assert!(!terminate(&host, 1, Duration::ZERO).await);
        assert_eq!(host.call_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_all_batches_and_dedups() {
        let host = ScriptedTarget::new()
            .on_delayed("kill -TERM", Duration::from_millis(20), ExecutionResult::ok("ok\n"))
            .on("kill -0", ExecutionResult::from_exit(1, "", ""));

        let pids: Vec<u32> = (100..112).chain([100, 101]).collect();
        let started = Instant::now();
        let killed = terminate_all(&host, &pids, policy(5)).await;

        assert_eq!(killed, (100..112).collect::<Vec<u32>>());
        assert_eq!(host.calls_matching("kill -TERM"), 12);
        // 12 pids in groups of 5 take three rounds
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
