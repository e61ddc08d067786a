//! Configuration management for servectl
//!
//! Provides a unified configuration system that supports YAML files and
//! environment variable overrides on top of documented defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "SERVECTL_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Retry decorator policy
    pub retry: RetryConfig,

    /// Timeout decorator policy
    pub timeout: TimeoutConfig,

    /// Connection pool policy
    pub pool: PoolConfig,

    /// Service lifecycle tuning
    pub lifecycle: LifecycleConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Known servers
    pub servers: Vec<ServerEntry>,
}

impl ServeConfig {
    /// Load configuration with precedence:
    /// 1. Environment variables (`SERVECTL_RETRY__MAX_RETRIES=5`)
    /// 2. Configuration file (`path`, then `$SERVECTL_CONFIG`, then `./servectl.yaml`)
    /// 3. Defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()));
            }
            None => {
                if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
                    builder = builder.add_source(config::File::with_name(&config_path));
                } else {
                    builder = builder
                        .add_source(config::File::with_name("./servectl.yaml").required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SERVECTL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let parsed: Self = serde_yaml::from_str(content)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.timeout.validate()?;
        self.pool.validate()?;
        self.lifecycle.validate()?;

        let mut ids = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !ids.insert(server.id.as_str()) {
                return Err(Error::config(format!("Duplicate server id '{}'", server.id)));
            }
        }

        Ok(())
    }

    /// Look up a server entry by id
    pub fn server(&self, id: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|server| server.id == id)
    }
}

/// Retry decorator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay_ms: u64,

    /// Each further retry waits `multiplier` times longer. Not capped.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries > 10 {
            return Err(Error::config("retry.max_retries must be at most 10"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config("retry.backoff_multiplier must be >= 1.0"));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based):
    /// `initial_delay_ms * backoff_multiplier^attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if millis.is_finite() && millis < u64::MAX as f64 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::from_millis(u64::MAX)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Timeout decorator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub timeout_ms: u64,
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::config("timeout.timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Soft cap on pooled identities; idle entries are evicted LRU-first
    /// when exceeded, busy entries are never evicted
    pub max_size: usize,

    /// Idle entries are evicted after this long without use
    pub idle_timeout_ms: u64,

    /// Entries older than this are replaced on the next acquire
    pub max_age_ms: u64,

    /// Dial timeout for new connections
    pub connect_timeout_ms: u64,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool.max_size must be greater than 0"));
        }
        if self.idle_timeout_ms == 0 {
            return Err(Error::config("pool.idle_timeout_ms must be greater than 0"));
        }
        if self.max_age_ms < self.idle_timeout_ms {
            return Err(Error::config("pool.max_age_ms must be >= pool.idle_timeout_ms"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::config("pool.connect_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_timeout_ms: 5 * 60 * 1000,
            max_age_ms: 60 * 60 * 1000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Service lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Default directory for service logs (may start with `~/`)
    pub log_dir: String,

    /// Wait after launch before the first liveness check
    pub settle_delay_ms: u64,

    /// Liveness checks before a start is declared failed
    pub confirm_attempts: u32,

    /// Pause between liveness checks
    pub confirm_interval_ms: u64,

    /// Log lines attached to a failed start
    pub log_tail_lines: usize,

    /// Processes signalled concurrently per batch
    pub kill_batch_size: usize,

    /// Pause between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_dir.trim().is_empty() {
            return Err(Error::config("lifecycle.log_dir must not be empty"));
        }
        if self.confirm_attempts == 0 {
            return Err(Error::config("lifecycle.confirm_attempts must be greater than 0"));
        }
        if self.kill_batch_size == 0 {
            return Err(Error::config("lifecycle.kill_batch_size must be greater than 0"));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            log_dir: "~/.servectl/logs".to_string(),
            settle_delay_ms: 5_000,
            confirm_attempts: 3,
            confirm_interval_ms: 2_000,
            log_tail_lines: 50,
            kill_batch_size: 5,
            kill_grace_ms: 1_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

/// A remote server reachable over SSH
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    pub auth: AuthConfig,
}

fn default_ssh_port() -> u16 {
    22
}

impl ServerEntry {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::config("server id must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::config(format!("server '{}' has no host", self.id)));
        }
        if self.username.trim().is_empty() {
            return Err(Error::config(format!("server '{}' has no username", self.id)));
        }
        Ok(())
    }

    /// Host identity derived from this entry
    pub fn identity(&self) -> crate::HostIdentity {
        crate::HostIdentity::remote(&self.host, self.port, &self.username)
    }
}

/// SSH authentication material
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Password {
        password: String,
    },
    Key {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::Password { .. } => f.write_str("Password(***)"),
            AuthConfig::Key { path, .. } => f.debug_struct("Key").field("path", path).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.timeout.timeout_ms, 30_000);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.pool.max_age(), Duration::from_secs(3600));
    }

    #[test]
    fn test_backoff_delays() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ServeConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = ServeConfig::default();
        config.pool.max_age_ms = 10;
        assert!(config.validate().is_err());

        let mut config = ServeConfig::default();
        config.timeout.timeout_ms = 0;
        assert!(config.validate().unwrap_err().is_programmer_error());
    }

    #[test]
    fn test_yaml_round_trip_with_servers() {
        let yaml = r#"
retry:
  max_retries: 2
servers:
  - id: gpu-1
    host: 10.0.0.5
    username: ml
    auth:
      type: key
      path: /home/ml/.ssh/id_ed25519
  - id: gpu-2
    host: 10.0.0.6
    port: 2222
    username: root
    auth:
      type: password
      password: hunter2
"#;
        let config = ServeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.servers.len(), 2);

        let gpu1 = config.server("gpu-1").unwrap();
        assert_eq!(gpu1.port, 22);
        assert_eq!(gpu1.identity().key(), "10.0.0.5:22@ml");

        let gpu2 = config.server("gpu-2").unwrap();
        assert!(matches!(gpu2.auth, AuthConfig::Password { .. }));
        assert!(!format!("{:?}", gpu2.auth).contains("hunter2"));
    }

    #[test]
    fn test_duplicate_server_ids_rejected() {
        let yaml = r#"
servers:
  - { id: a, host: h1, username: u, auth: { type: password, password: p } }
  - { id: a, host: h2, username: u, auth: { type: password, password: p } }
"#;
        let err = ServeConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate server id"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "timeout:\n  timeout_ms: 1234\npool:\n  max_size: 4").unwrap();

        let config = ServeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.timeout.timeout_ms, 1234);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.idle_timeout_ms, 300_000);
    }
}
