//! Rule-based fake execution target

use async_trait::async_trait;
use serve_core::{ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

struct Rule {
    pattern: String,
    responses: VecDeque<ExecutionResult>,
    delay: Option<Duration>,
}

/// Answers commands from substring rules and records every command it sees.
///
/// The first rule whose pattern occurs in the command wins. A rule with a
/// sequence of responses hands them out in order and repeats the last one.
/// Commands matching no rule get the fallback (exit 127 unless overridden).
pub struct ScriptedTarget {
    identity: HostIdentity,
    rules: Mutex<Vec<Rule>>,
    fallback: ExecutionResult,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTarget {
    pub fn new() -> Self {
        Self::with_identity(HostIdentity::remote("scripted", 22, "test"))
    }

    pub fn with_identity(identity: HostIdentity) -> Self {
        Self {
            identity,
            rules: Mutex::new(Vec::new()),
            fallback: ExecutionResult::from_exit(127, "", "sh: command not found"),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, pattern: impl Into<String>, result: ExecutionResult) -> Self {
        self.push_rule(pattern.into(), vec![result], None)
    }

    pub fn on_sequence(self, pattern: impl Into<String>, results: Vec<ExecutionResult>) -> Self {
        self.push_rule(pattern.into(), results, None)
    }

    pub fn on_delayed(self, pattern: impl Into<String>, delay: Duration, result: ExecutionResult) -> Self {
        self.push_rule(pattern.into(), vec![result], Some(delay))
    }

    pub fn otherwise(mut self, result: ExecutionResult) -> Self {
        self.fallback = result;
        self
    }

    fn push_rule(self, pattern: String, responses: Vec<ExecutionResult>, delay: Option<Duration>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                pattern,
                responses: responses.into(),
                delay,
            });
        }
        self
    }

    /// Every command executed so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|call| call.contains(pattern)).count()
    }

    fn respond(&self, command: &str) -> (ExecutionResult, Option<Duration>) {
        let Ok(mut rules) = self.rules.lock() else {
            return (self.fallback.clone(), None);
        };
        for rule in rules.iter_mut() {
            if command.contains(&rule.pattern) {
                let result = if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                };
                return (result.unwrap_or_else(|| self.fallback.clone()), rule.delay);
            }
        }
        (self.fallback.clone(), None)
    }
}

impl Default for ScriptedTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionTarget for ScriptedTarget {
    fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    async fn execute(&self, command: &str, _options: &ExecOptions) -> ExecutionResult {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.to_string());
        }

        let (result, delay) = self.respond(command);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_and_sequences() {
        let target = ScriptedTarget::new()
            .on("hostname", ExecutionResult::ok("gpu-1"))
            .on_sequence(
                "uptime",
                vec![ExecutionResult::failure("reset"), ExecutionResult::ok("up")],
            );

        assert_eq!(target.run("hostname -f").await.stdout, "gpu-1");
        assert!(!target.run("uptime").await.success);
        assert!(target.run("uptime").await.success);
        assert!(target.run("uptime").await.success);
        assert_eq!(target.run("whoami").await.exit_code, 127);

        assert_eq!(target.call_count(), 5);
        assert_eq!(target.calls_matching("uptime"), 3);
    }
}
