//! Recognising a service's processes in a process listing
//!
//! All heuristic matching sits behind [`ProcessMatcher`] so a platform- or
//! framework-specific matcher can replace the default without touching the
//! state machine.

use crate::command::CommandSignature;
use crate::probe::ProcessInfo;
use std::collections::HashMap;

pub trait ProcessMatcher: Send + Sync {
    /// Whether `command_line` runs the command described by `signature`
    fn matches_signature(&self, signature: &CommandSignature, command_line: &str) -> bool;

    /// Whether `command_line` mentions `keyword` (and `port`, when given)
    fn matches_keyword(&self, keyword: &str, port: Option<u16>, command_line: &str) -> bool;
}

/// Token-based matcher: same program (any python counts as python), same
/// entry point, and the port on the command line when the service was
/// given one there.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProcessMatcher;

fn basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn is_python(name: &str) -> bool {
    name.strip_prefix("python")
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

fn same_program(expected: &str, actual: &str) -> bool {
    expected == actual || (is_python(expected) && is_python(actual))
}

/// `9000`, `--port=9000`, `0.0.0.0:9000`
fn mentions_port(tokens: &[&str], port: u16) -> bool {
    let port = port.to_string();
    tokens.iter().any(|token| {
        *token == port
            || token
                .strip_suffix(port.as_str())
                .is_some_and(|head| head.ends_with('=') || head.ends_with(':'))
    })
}

impl ProcessMatcher for DefaultProcessMatcher {
    fn matches_signature(&self, signature: &CommandSignature, command_line: &str) -> bool {
        let tokens: Vec<&str> = command_line.split_whitespace().collect();
        if !tokens.iter().any(|t| same_program(&signature.program, basename(t))) {
            return false;
        }
        if signature.entry != signature.program
            && !tokens
                .iter()
                .any(|t| *t == signature.entry || basename(t) == signature.entry)
        {
            return false;
        }
        match (signature.port, signature.port_in_args) {
            (Some(port), true) => mentions_port(&tokens, port),
            _ => true,
        }
    }

    fn matches_keyword(&self, keyword: &str, port: Option<u16>, command_line: &str) -> bool {
        if keyword.is_empty() || !command_line.to_lowercase().contains(&keyword.to_lowercase()) {
            return false;
        }
        match port {
            Some(port) => {
                let tokens: Vec<&str> = command_line.split_whitespace().collect();
                mentions_port(&tokens, port)
            }
            None => true,
        }
    }
}

/// Descendants of `root`, deepest first, `root` excluded
pub fn descendants(table: &[ProcessInfo], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for process in table {
        if process.pid != process.ppid {
            children.entry(process.ppid).or_default().push(process.pid);
        }
    }

    fn visit(pid: u32, children: &HashMap<u32, Vec<u32>>, seen: &mut Vec<u32>, out: &mut Vec<u32>) {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if seen.contains(&kid) {
                    continue;
                }
                seen.push(kid);
                visit(kid, children, seen, out);
                out.push(kid);
            }
        }
    }

    let mut seen = vec![root];
    let mut out = Vec::new();
    visit(root, &children, &mut seen, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ParsedCommand;

    fn signature(command: &str) -> CommandSignature {
        ParsedCommand::parse(command).unwrap().signature
    }

    #[test]
    fn test_signature_match() {
        let matcher = DefaultProcessMatcher;
        let sig = signature("python server.py --port 9000");

        assert!(matcher.matches_signature(&sig, "/usr/bin/python3 /srv/app/server.py --port 9000"));
        assert!(matcher.matches_signature(&sig, "python server.py --port=9000 --workers 2"));
        assert!(!matcher.matches_signature(&sig, "python server.py --port 9001"));
        assert!(!matcher.matches_signature(&sig, "python other.py --port 9000"));
        assert!(!matcher.matches_signature(&sig, "node server.py --port 9000"));
    }

    #[test]
    fn test_module_entry_and_env_port() {
        let matcher = DefaultProcessMatcher;

        let sig = signature("python -m vllm.entrypoints.openai.api_server --model m");
        assert!(matcher.matches_signature(&sig, "python3 -m vllm.entrypoints.openai.api_server --model m"));

        // port only known from the environment, not required on the command line
        let sig = signature("OLLAMA_HOST=0.0.0.0:11434 ollama serve");
        assert!(matcher.matches_signature(&sig, "/usr/local/bin/ollama serve"));
    }

    #[test]
    fn test_keyword_match() {
        let matcher = DefaultProcessMatcher;

        assert!(matcher.matches_keyword("vllm", None, "python -m vLLM.entrypoints.api_server"));
        assert!(matcher.matches_keyword("vllm", Some(8000), "vllm serve m --host 0.0.0.0 --port 8000"));
        assert!(!matcher.matches_keyword("vllm", Some(8000), "vllm serve m --port 8001"));
        assert!(!matcher.matches_keyword("", None, "anything"));
    }

    #[test]
    fn test_descendants_deepest_first() {
        let table = vec![
            ProcessInfo { pid: 10, ppid: 1, args: "wrapper".into() },
            ProcessInfo { pid: 11, ppid: 10, args: "server".into() },
            ProcessInfo { pid: 12, ppid: 11, args: "worker".into() },
            ProcessInfo { pid: 13, ppid: 10, args: "logger".into() },
            ProcessInfo { pid: 20, ppid: 1, args: "unrelated".into() },
        ];

        assert_eq!(descendants(&table, 10), vec![12, 11, 13]);
        assert!(descendants(&table, 20).is_empty());
        assert!(descendants(&table, 99).is_empty());
    }
}
