//! Failure classification
//!
//! Free-text failure messages (stderr, transport errors) are mapped onto a
//! closed taxonomy by case-insensitive keyword matching. Groups are checked
//! in table order and the first group with a matching keyword wins.

use crate::ExecutionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ConnectionRefused,
    Timeout,
    PermissionDenied,
    CommandNotFound,
    Network,
    AuthenticationFailed,
    Temporary,
    Unknown,
}

impl ErrorKind {
    /// Kinds that the retry decorator re-attempts
    pub const RETRYABLE: [ErrorKind; 4] = [
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::ConnectionRefused,
        ErrorKind::Temporary,
    ];

    pub fn is_retryable(self) -> bool {
        Self::RETRYABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionRefused => "connection-refused",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::CommandNotFound => "command-not-found",
            ErrorKind::Network => "network",
            ErrorKind::AuthenticationFailed => "authentication-failed",
            ErrorKind::Temporary => "temporary",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered keyword table; keywords are lowercase
const KEYWORD_GROUPS: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::ConnectionRefused,
        &["econnrefused", "connection refused"],
    ),
    (ErrorKind::Timeout, &["etimedout", "timed out", "timeout"]),
    (
        ErrorKind::PermissionDenied,
        &["permission denied", "eacces", "operation not permitted", "eperm"],
    ),
    (
        ErrorKind::CommandNotFound,
        &[
            "command not found",
            "enoent",
            "is not recognized as an internal or external command",
        ],
    ),
    (
        ErrorKind::Network,
        &[
            "network",
            "enetunreach",
            "ehostunreach",
            "no route to host",
            "host unreachable",
            "econnreset",
            "connection reset",
            "broken pipe",
            "enotfound",
            "could not resolve",
            "name or service not known",
        ],
    ),
    (
        ErrorKind::AuthenticationFailed,
        &[
            "authentication failed",
            "authentication methods failed",
            "auth fail",
            "invalid credentials",
        ],
    ),
    (
        ErrorKind::Temporary,
        &[
            "temporary",
            "temporarily",
            "try again",
            "eagain",
            "resource busy",
            "service unavailable",
        ],
    ),
];

/// Stateless classifier over [`KEYWORD_GROUPS`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a free-text failure message
    pub fn classify(message: &str) -> ErrorKind {
        let lowered = message.to_lowercase();
        KEYWORD_GROUPS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|keyword| lowered.contains(keyword)))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    pub fn is_retryable(message: &str) -> bool {
        Self::classify(message).is_retryable()
    }

    /// Classify an execution result. Successful results are `Unknown`
    /// (there is nothing to classify); timed-out results are always `Timeout`.
    pub fn classify_result(result: &ExecutionResult) -> ErrorKind {
        if result.timed_out {
            return ErrorKind::Timeout;
        }
        if result.success {
            return ErrorKind::Unknown;
        }
        Self::classify(result.error_text())
    }

    pub fn is_retryable_result(result: &ExecutionResult) -> bool {
        !result.success && Self::classify_result(result).is_retryable()
    }

    /// Build a record for a failure message
    pub fn record(message: impl Into<String>) -> ErrorRecord {
        let message = message.into();
        ErrorRecord::new(Self::classify(&message), message)
    }
}

/// A classified failure, as published on the error bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,

    /// Host key or component the failure came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            timestamp: Utc::now(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_each_group() {
        let cases = [
            ("connect ECONNREFUSED 127.0.0.1:22", ErrorKind::ConnectionRefused),
            ("ssh: connect to host x port 22: Connection refused", ErrorKind::ConnectionRefused),
            ("Operation timed out", ErrorKind::Timeout),
            ("bash: line 1: /root/x: Permission denied", ErrorKind::PermissionDenied),
            ("sh: 1: nvidia-smi: command not found", ErrorKind::CommandNotFound),
            ("No route to host", ErrorKind::Network),
            ("Authentication failed for root", ErrorKind::AuthenticationFailed),
            ("Resource temporarily unavailable", ErrorKind::Temporary),
            ("segmentation fault", ErrorKind::Unknown),
        ];

        for (message, expected) in cases {
            assert_eq!(ErrorClassifier::classify(message), expected, "{}", message);
        }
    }

    #[test]
    fn test_first_group_wins() {
        // Matches both connection-refused and network keywords
        let kind = ErrorClassifier::classify("network error: connection refused");
        assert_eq!(kind, ErrorKind::ConnectionRefused);

        // "Connection timed out" is a timeout, not a network failure
        let kind = ErrorClassifier::classify("Connection timed out");
        assert_eq!(kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_classify_is_case_insensitive_and_deterministic() {
        let a = ErrorClassifier::classify("PERMISSION DENIED");
        let b = ErrorClassifier::classify("PERMISSION DENIED");
        assert_eq!(a, ErrorKind::PermissionDenied);
        assert_eq!(a, b);
    }

    #[test]
    fn test_retryable_set() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::ConnectionRefused.is_retryable());
        assert!(ErrorKind::Temporary.is_retryable());
        assert!(!ErrorKind::PermissionDenied.is_retryable());
        assert!(!ErrorKind::CommandNotFound.is_retryable());
        assert!(!ErrorKind::AuthenticationFailed.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_classify_result() {
        let ok = ExecutionResult::ok("fine");
        assert!(!ErrorClassifier::is_retryable_result(&ok));

        let timed_out = ExecutionResult::timed_out(100);
        assert_eq!(ErrorClassifier::classify_result(&timed_out), ErrorKind::Timeout);

        let flaky = ExecutionResult::from_exit(255, "", "kex_exchange_identification: Connection reset by peer");
        assert!(ErrorClassifier::is_retryable_result(&flaky));

        let missing = ExecutionResult::from_exit(127, "", "sh: rocm-smi: command not found");
        assert!(!ErrorClassifier::is_retryable_result(&missing));
    }

    #[test]
    fn test_record_retryable_follows_kind() {
        let record = ErrorClassifier::record("Network is unreachable").with_source("gpu-1:22@root");
        assert_eq!(record.kind, ErrorKind::Network);
        assert!(record.retryable);
        assert_eq!(record.source.as_deref(), Some("gpu-1:22@root"));

        let json = serde_json::to_string(&record.kind).unwrap();
        assert_eq!(json, "\"network\"");
    }
}
