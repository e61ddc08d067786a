//! Service descriptors, states and operation reports

use crate::{LifecycleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the service's interpreter environment is activated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvType {
    /// Run the command as-is
    #[default]
    System,
    /// Run through `<conda|mamba|micromamba> run -n <env>`
    Conda,
    /// Source `<env>/bin/activate` first
    Venv,
}

impl fmt::Display for EnvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvType::System => "system",
            EnvType::Conda => "conda",
            EnvType::Venv => "venv",
        };
        f.write_str(name)
    }
}

/// A service the lifecycle manager can start and stop.
///
/// `pid` is a hint: it may be stale or absent. The durable identity of a
/// service is its server plus the signature derived from `start_command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub id: String,
    pub server_id: String,
    #[serde(default)]
    pub env_type: EnvType,
    /// Conda environment name, or virtualenv directory
    #[serde(default)]
    pub env_name: Option<String>,
    pub start_command: String,
    /// Overrides the port found in the command
    #[serde(default)]
    pub port: Option<u16>,
    /// Defaults to `<log_dir>/<id>.log`
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Overrides the model path found in the command
    #[serde(default)]
    pub model_path: Option<String>,
}

impl ServiceDescriptor {
    pub fn new(id: impl Into<String>, server_id: impl Into<String>, start_command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            server_id: server_id.into(),
            env_type: EnvType::System,
            env_name: None,
            start_command: start_command.into(),
            port: None,
            log_path: None,
            pid: None,
            model_path: None,
        }
    }

    pub fn with_env(mut self, env_type: EnvType, env_name: impl Into<String>) -> Self {
        self.env_type = env_type;
        self.env_name = Some(env_name.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_model_path(mut self, path: impl Into<String>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(LifecycleError::InvalidDescriptor("service id must not be empty".into()));
        }
        if self.server_id.trim().is_empty() {
            return Err(LifecycleError::InvalidDescriptor(format!(
                "service {} has no server id",
                self.id
            )));
        }
        if self.start_command.trim().is_empty() {
            return Err(LifecycleError::InvalidDescriptor(format!(
                "service {} has no start command",
                self.id
            )));
        }
        if self.port == Some(0) {
            return Err(LifecycleError::InvalidDescriptor(format!("service {} has port 0", self.id)));
        }
        Ok(())
    }
}

/// Lifecycle states.
///
/// ```text
/// stopped -> starting -> running -> stopping -> stopped
///               |                      |
///               +------> error <-------+
/// ```
///
/// `error` can be left by starting again or by stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Starting)
                | (Error, Stopping)
        )
    }

    /// Whether an operation is in flight
    pub fn is_transient(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Stopping)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Outcome of [`start`](crate::ServiceLifecycleManager::start)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub service_id: String,
    /// `running` or `error`
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub log_path: String,
    /// Command line that was launched, wrapper included
    pub command: String,
    pub clean_command: String,
    /// `VAR=value` restricting accelerator visibility, when present
    pub visible_devices: Option<String>,
    /// Failure detail
    pub message: Option<String>,
    /// Last lines of the service log on failure
    pub log_tail: Option<String>,
}

impl StartReport {
    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }
}

/// The cascading stop strategies, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopStep {
    /// Known pid and its descendants
    ProcessTree,
    /// Processes whose command line contains the model path
    ModelPath,
    /// Processes listening on the service port
    Port,
    /// Framework keyword or command signature match
    FrameworkPattern,
    /// Accelerator processes captured before the stop began
    CapturedAccelerator,
    /// Final sweep over current accelerator processes
    AcceleratorSweep,
}

impl StopStep {
    pub const ALL: [StopStep; 6] = [
        StopStep::ProcessTree,
        StopStep::ModelPath,
        StopStep::Port,
        StopStep::FrameworkPattern,
        StopStep::CapturedAccelerator,
        StopStep::AcceleratorSweep,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StopStep::ProcessTree => "process-tree",
            StopStep::ModelPath => "model-path",
            StopStep::Port => "port",
            StopStep::FrameworkPattern => "framework-pattern",
            StopStep::CapturedAccelerator => "captured-accelerator",
            StopStep::AcceleratorSweep => "accelerator-sweep",
        }
    }
}

impl fmt::Display for StopStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one stop step found and terminated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step: StopStep,
    pub candidates: Vec<u32>,
    pub killed: Vec<u32>,
    /// Why the step did not run
    pub skipped: Option<String>,
}

impl StepOutcome {
    pub fn skipped(step: StopStep, reason: impl Into<String>) -> Self {
        Self {
            step,
            candidates: Vec::new(),
            killed: Vec::new(),
            skipped: Some(reason.into()),
        }
    }

    pub fn ran(step: StopStep, candidates: Vec<u32>, killed: Vec<u32>) -> Self {
        Self {
            step,
            candidates,
            killed,
            skipped: None,
        }
    }
}

/// Outcome of [`stop`](crate::ServiceLifecycleManager::stop)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub service_id: String,
    /// Something was killed, or nothing was found
    pub success: bool,
    /// Every pid terminated, across all steps
    pub killed: Vec<u32>,
    pub steps: Vec<StepOutcome>,
    /// Whether the port stopped listening, when a port is known
    pub port_released: Option<bool>,
    pub message: Option<String>,
}

impl StopReport {
    /// Whether no step found anything to kill
    pub fn already_stopped(&self) -> bool {
        self.steps.iter().all(|s| s.candidates.is_empty())
    }

    pub fn step(&self, step: StopStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }
}

/// What the host shows, independent of the recorded state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Running,
    Stopped,
}

/// Outcome of [`status`](crate::ServiceLifecycleManager::status)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service_id: String,
    /// State recorded by the manager, if it knows the service
    pub state: Option<ServiceState>,
    pub observed: ObservedState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub port_listening: Option<bool>,
    /// Every process matching the command signature
    pub matching_pids: Vec<u32>,
}

/// A tracked service as listed by the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub descriptor: ServiceDescriptor,
    pub state: ServiceState,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
