//! The service lifecycle state machine
//!
//! Start launches the cleaned command detached on the host and confirms it
//! by two independent signals: the port is listening and a process matching
//! the command signature exists. Stop does not trust the remembered pid; it
//! runs a cascade of best-effort strategies and reports what each found.

use crate::command::{CommandSignature, ParsedCommand};
use crate::discovery::ToolDiscovery;
use crate::matcher::{descendants, DefaultProcessMatcher, ProcessMatcher};
use crate::probe::{self, shell_path, shell_quote, ProcessInfo};
use crate::types::{
    EnvType, ObservedState, ServiceDescriptor, ServiceSnapshot, ServiceState, ServiceStatus, StartReport,
    StepOutcome, StopReport, StopStep,
};
use crate::{LifecycleError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serve_accel::{kill, AcceleratorProcess, AcceleratorRegistry, KillPolicy};
use serve_core::{ErrorBus, ErrorClassifier, ExecutionTarget, LifecycleConfig, TargetResolver};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct ServiceRecord {
    descriptor: ServiceDescriptor,
    state: ServiceState,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            state: ServiceState::Stopped,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// How the clean command is wrapped for its environment
#[derive(Debug, Clone, PartialEq, Eq)]
enum Activation {
    None,
    Venv(String),
    Conda { tool: String, env: String },
}

/// Body of the detached `sh -c`
fn compose_inner(parsed: &ParsedCommand, activation: &Activation) -> String {
    let mut parts = Vec::new();
    if let Some(dir) = &parsed.working_dir {
        parts.push(format!("cd {}", shell_path(dir)));
    }
    if !parsed.env.is_empty() {
        let assignments = parsed
            .env
            .iter()
            .map(|(name, value)| format!("{}={}", name, shell_quote(value)))
            .collect::<Vec<_>>()
            .join(" ");
        parts.push(format!("export {}", assignments));
    }

    let run = match activation {
        Activation::None => format!("exec {}", parsed.clean),
        Activation::Venv(env) => {
            parts.push(format!(". {}", shell_path(&format!("{}/bin/activate", env.trim_end_matches('/')))));
            format!("exec {}", parsed.clean)
        }
        Activation::Conda { tool, env } => {
            let selector = if env.starts_with('/') || env.starts_with("~/") { "-p" } else { "-n" };
            format!(
                "exec {} run --no-capture-output {} {} {}",
                shell_quote(tool),
                selector,
                shell_path(env),
                parsed.clean
            )
        }
    };
    parts.push(run);
    parts.join(" && ")
}

/// Detach `inner` from the calling channel and print the launched pid
fn launch_command(inner: &str, log_path: &str) -> String {
    format!(
        "nohup sh -c {} > {} 2>&1 < /dev/null & echo $!",
        shell_quote(inner),
        shell_path(log_path)
    )
}

/// One look at the host
#[derive(Debug, Default)]
struct Observation {
    table: Vec<ProcessInfo>,
    matching: Vec<u32>,
    listening: Option<bool>,
    owners: Vec<u32>,
}

impl Observation {
    /// Both signals agree: a matching process exists and the port (when
    /// known) is listening
    fn is_running(&self) -> bool {
        !self.matching.is_empty() && self.listening != Some(false)
    }

    /// Prefer the matching port owner, then a matching process in the
    /// launched tree, then any match
    fn choose_pid(&self, launched: Option<u32>) -> Option<u32> {
        if let Some(pid) = self.owners.iter().find(|pid| self.matching.contains(pid)) {
            return Some(*pid);
        }
        if let Some(root) = launched {
            if let Some(pid) = descendants(&self.table, root)
                .into_iter()
                .find(|pid| self.matching.contains(pid))
            {
                return Some(pid);
            }
            if self.matching.contains(&root) {
                return Some(root);
            }
        }
        self.owners.first().or_else(|| self.matching.first()).copied()
    }

    fn contains(&self, pid: u32) -> bool {
        self.table.iter().any(|p| p.pid == pid)
    }
}

/// Moves a record left in `Starting` or `Stopping` to `Error` when the
/// operation that put it there is dropped before finishing
struct TransientGuard<'a> {
    services: &'a DashMap<String, ServiceRecord>,
    service_id: String,
    operation: &'static str,
    armed: bool,
}

impl<'a> TransientGuard<'a> {
    fn new(services: &'a DashMap<String, ServiceRecord>, service_id: &str, operation: &'static str) -> Self {
        Self {
            services,
            service_id: service_id.to_string(),
            operation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransientGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(mut record) = self.services.get_mut(&self.service_id) {
            if record.state.is_transient() {
                let from = record.state;
                record.state = ServiceState::Error;
                record.last_error = Some(format!("{} cancelled", self.operation));
                record.updated_at = Utc::now();
                warn!(service = %self.service_id, from = %from, "Service {} cancelled", self.operation);
            }
        }
    }
}

/// What stop hunts for
struct HuntTarget {
    pid: Option<u32>,
    port: Option<u16>,
    model_path: Option<String>,
    keyword: Option<String>,
    signature: Option<CommandSignature>,
}

/// Starts, stops and tracks services.
///
/// Built once per process and shared; the host connections, accelerator
/// registry and error bus it uses are injected.
pub struct ServiceLifecycleManager {
    resolver: Arc<dyn TargetResolver>,
    registry: Arc<AcceleratorRegistry>,
    discovery: Arc<ToolDiscovery>,
    matcher: Arc<dyn ProcessMatcher>,
    config: LifecycleConfig,
    policy: KillPolicy,
    services: DashMap<String, ServiceRecord>,
    bus: Option<ErrorBus>,
}

impl ServiceLifecycleManager {
    pub fn new(resolver: Arc<dyn TargetResolver>, registry: Arc<AcceleratorRegistry>, config: LifecycleConfig) -> Self {
        Self {
            resolver,
            registry,
            discovery: Arc::new(ToolDiscovery::new()),
            matcher: Arc::new(DefaultProcessMatcher),
            policy: KillPolicy::from(&config),
            config,
            services: DashMap::new(),
            bus: None,
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<ToolDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn ProcessMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Publish start and stop failures on `bus`
    pub fn with_error_bus(mut self, bus: ErrorBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn discovery(&self) -> &Arc<ToolDiscovery> {
        &self.discovery
    }

    /// Recorded state, `None` for a service this manager has not seen
    pub fn state(&self, service_id: &str) -> Option<ServiceState> {
        self.services.get(service_id).map(|r| r.state)
    }

    /// Last pid recorded for the service
    pub fn pid(&self, service_id: &str) -> Option<u32> {
        self.services.get(service_id).and_then(|r| r.descriptor.pid)
    }

    pub fn list_services(&self) -> Vec<ServiceSnapshot> {
        let mut services: Vec<ServiceSnapshot> = self
            .services
            .iter()
            .map(|entry| {
                let record = entry.value();
                ServiceSnapshot {
                    descriptor: record.descriptor.clone(),
                    state: record.state,
                    last_error: record.last_error.clone(),
                    updated_at: record.updated_at,
                }
            })
            .collect();
        services.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        services
    }

    /// Drop a service that is not mid-operation
    pub fn forget(&self, service_id: &str) -> bool {
        self.services
            .remove_if(service_id, |_, record| !record.state.is_transient())
            .is_some()
    }

    /// `descriptor.log_path`, else `<log_dir>/<id>.log`
    pub fn log_path(&self, descriptor: &ServiceDescriptor) -> String {
        match &descriptor.log_path {
            Some(path) => path.clone(),
            None => format!("{}/{}.log", self.config.log_dir.trim_end_matches('/'), descriptor.id),
        }
    }

    fn transition(&self, descriptor: &ServiceDescriptor, to: ServiceState) -> Result<ServiceState> {
        let mut record = self
            .services
            .entry(descriptor.id.clone())
            .or_insert_with(|| ServiceRecord::new(descriptor.clone()));
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition {
                service: descriptor.id.clone(),
                from,
                to,
            });
        }
        if to == ServiceState::Starting {
            record.descriptor = ServiceDescriptor {
                pid: None,
                ..descriptor.clone()
            };
            record.last_error = None;
        }
        record.state = to;
        record.updated_at = Utc::now();
        drop(record);

        info!(service = %descriptor.id, server = %descriptor.server_id, from = %from, to = %to, "Service state changed");
        Ok(from)
    }

    fn update(&self, service_id: &str, apply: impl FnOnce(&mut ServiceRecord)) {
        if let Some(mut record) = self.services.get_mut(service_id) {
            apply(&mut record);
            record.updated_at = Utc::now();
        }
    }

    fn publish(&self, descriptor: &ServiceDescriptor, message: &str) {
        if let Some(bus) = &self.bus {
            let record = ErrorClassifier::record(message)
                .with_source(format!("service:{}@{}", descriptor.id, descriptor.server_id));
            bus.publish(&record);
        }
    }

    /// Launch the service and confirm it came up.
    ///
    /// A service that fails to come up is reported as `Ok` with
    /// `state == Error`, the failure detail and the tail of its log. `Err`
    /// is reserved for requests that cannot be acted on: an invalid
    /// descriptor or command, an unknown server, or a service that is not
    /// stopped.
    pub async fn start(&self, descriptor: &ServiceDescriptor) -> Result<StartReport> {
        descriptor.validate()?;
        let parsed = ParsedCommand::parse(&descriptor.start_command)?;
        let host = self.resolver.resolve(&descriptor.server_id).await?;
        self.transition(descriptor, ServiceState::Starting)?;
        let guard = TransientGuard::new(&self.services, &descriptor.id, "start");

        let log_path = self.log_path(descriptor);
        let port = descriptor.port.or(parsed.port);
        let mut report = StartReport {
            service_id: descriptor.id.clone(),
            state: ServiceState::Starting,
            pid: None,
            port,
            log_path: log_path.clone(),
            command: String::new(),
            clean_command: parsed.clean.clone(),
            visible_devices: parsed
                .visible_devices
                .as_ref()
                .map(|(name, value)| format!("{}={}", name, value)),
            message: None,
            log_tail: None,
        };

        match self.launch(host.as_ref(), descriptor, &parsed, port, &mut report).await {
            Ok(pid) => {
                self.transition(descriptor, ServiceState::Running)?;
                self.update(&descriptor.id, |record| record.descriptor.pid = Some(pid));
                info!(service = %descriptor.id, pid, port = ?port, "Service running");
                report.state = ServiceState::Running;
                report.pid = Some(pid);
            }
            Err(message) => {
                let tail = probe::tail_file(host.as_ref(), &log_path, self.config.log_tail_lines).await;
                self.transition(descriptor, ServiceState::Error)?;
                self.update(&descriptor.id, |record| record.last_error = Some(message.clone()));
                warn!(service = %descriptor.id, error = %message, "Service failed to start");
                self.publish(descriptor, &message);
                report.state = ServiceState::Error;
                report.log_tail = Some(tail).filter(|t| !t.trim().is_empty());
                report.message = Some(message);
            }
        }
        guard.disarm();
        Ok(report)
    }

    async fn launch(
        &self,
        host: &dyn ExecutionTarget,
        descriptor: &ServiceDescriptor,
        parsed: &ParsedCommand,
        port: Option<u16>,
        report: &mut StartReport,
    ) -> std::result::Result<u32, String> {
        if let Some(dir) = probe::parent_dir(&report.log_path) {
            let result = probe::ensure_dir(host, dir).await;
            if !result.success {
                return Err(format!("Failed to create log directory {}: {}", dir, result.error_text()));
            }
        }

        if let Some(port) = port {
            if probe::is_port_listening(host, port).await {
                return Err(format!("Port {} is already in use on {}", port, host.identity()));
            }
        }

        if let Some((name, value)) = &parsed.visible_devices {
            info!(service = %descriptor.id, variable = %name, devices = %value, "Restricting accelerator visibility");
        }

        let activation = self.activation(host, descriptor, parsed).await?;
        let command = launch_command(&compose_inner(parsed, &activation), &report.log_path);
        report.command = command.clone();

        debug!(service = %descriptor.id, command = %command, "Launching service");
        let result = host.run(&command).await;
        if !result.success {
            return Err(format!("Launch failed: {}", result.error_text()));
        }
        let launched = result
            .stdout_lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .last();

        if !self.config.settle_delay().is_zero() {
            tokio::time::sleep(self.config.settle_delay()).await;
        }

        let attempts = self.config.confirm_attempts.max(1);
        let mut last = Observation::default();
        for attempt in 1..=attempts {
            last = self.observe(host, &parsed.signature, port).await;
            if last.is_running() {
                if let Some(pid) = last.choose_pid(launched) {
                    return Ok(pid);
                }
            }

            let exited = last.matching.is_empty() && launched.is_some_and(|pid| !last.contains(pid));
            if exited && !last.table.is_empty() {
                debug!(service = %descriptor.id, attempt, "Launched process exited");
                break;
            }
            if attempt < attempts && !self.config.confirm_interval().is_zero() {
                tokio::time::sleep(self.config.confirm_interval()).await;
            }
        }

        Err(match (last.matching.is_empty(), last.listening) {
            (true, _) => format!("No running process matches '{}'", parsed.clean),
            (false, Some(false)) => format!(
                "Process is running but port {} is not listening",
                port.map(|p| p.to_string()).unwrap_or_default()
            ),
            _ => "Service could not be confirmed".to_string(),
        })
    }

    async fn activation(
        &self,
        host: &dyn ExecutionTarget,
        descriptor: &ServiceDescriptor,
        parsed: &ParsedCommand,
    ) -> std::result::Result<Activation, String> {
        let env_name = descriptor.env_name.clone().filter(|n| !n.trim().is_empty());
        let env_type = match descriptor.env_type {
            // activation written into the command itself still applies
            EnvType::System if parsed.conda_env.is_some() => EnvType::Conda,
            EnvType::System if parsed.venv.is_some() => EnvType::Venv,
            other => other,
        };

        match env_type {
            EnvType::System => Ok(Activation::None),
            EnvType::Venv => env_name
                .or_else(|| parsed.venv.clone())
                .map(Activation::Venv)
                .ok_or_else(|| format!("Service {} needs a virtualenv path", descriptor.id)),
            EnvType::Conda => {
                let env = env_name
                    .or_else(|| parsed.conda_env.clone())
                    .ok_or_else(|| format!("Service {} needs a conda environment name", descriptor.id))?;
                let (tool, path) = self
                    .discovery
                    .conda(host)
                    .await
                    .ok_or_else(|| format!("Could not locate conda, mamba or micromamba on {}", host.identity()))?;
                debug!(service = %descriptor.id, tool = %tool, path = %path, env = %env, "Using environment manager");
                Ok(Activation::Conda { tool: path, env })
            }
        }
    }

    async fn observe(&self, host: &dyn ExecutionTarget, signature: &CommandSignature, port: Option<u16>) -> Observation {
        let table = probe::process_table(host).await;
        let matching = table
            .iter()
            .filter(|p| self.matcher.matches_signature(signature, &p.args))
            .map(|p| p.pid)
            .collect();

        let (listening, owners) = match port {
            Some(port) => {
                let listening = probe::is_port_listening(host, port).await;
                let owners = if listening {
                    probe::port_owners(host, port).await
                } else {
                    Vec::new()
                };
                (Some(listening), owners)
            }
            None => (None, Vec::new()),
        };

        Observation {
            table,
            matching,
            listening,
            owners,
        }
    }

    /// Stop the service with the cascading strategy.
    ///
    /// A service this manager has not seen, or has already stopped, is still
    /// hunted for, without a state change. Stopping a service that is
    /// mid-start or mid-stop is an invalid transition.
    pub async fn stop(&self, descriptor: &ServiceDescriptor) -> Result<StopReport> {
        if descriptor.id.trim().is_empty() {
            return Err(LifecycleError::InvalidDescriptor("service id must not be empty".into()));
        }
        let current = self.state(&descriptor.id).unwrap_or_default();
        let tracked = matches!(current, ServiceState::Running | ServiceState::Error);
        if current.is_transient() {
            return Err(LifecycleError::InvalidTransition {
                service: descriptor.id.clone(),
                from: current,
                to: ServiceState::Stopping,
            });
        }

        let host = self.resolver.resolve(&descriptor.server_id).await?;
        let guard = if tracked {
            self.transition(descriptor, ServiceState::Stopping)?;
            Some(TransientGuard::new(&self.services, &descriptor.id, "stop"))
        } else {
            None
        };

        let parsed = ParsedCommand::parse(&descriptor.start_command).ok();
        let target = HuntTarget {
            pid: descriptor.pid.or_else(|| self.pid(&descriptor.id)),
            port: descriptor.port.or_else(|| parsed.as_ref().and_then(|p| p.port)),
            model_path: descriptor
                .model_path
                .clone()
                .or_else(|| parsed.as_ref().and_then(|p| p.model_path.clone()))
                .filter(|m| !m.trim().is_empty()),
            keyword: parsed.as_ref().and_then(|p| p.framework.clone()),
            signature: parsed.as_ref().map(|p| p.signature.clone()),
        };

        let mut report = self.hunt(host.as_ref(), &target).await;
        report.service_id = descriptor.id.clone();

        if report.success {
            info!(service = %descriptor.id, killed = ?report.killed, "Service stopped");
        } else {
            let message = report.message.clone().unwrap_or_default();
            warn!(service = %descriptor.id, error = %message, "Service stop incomplete");
            self.publish(descriptor, &message);
        }

        if tracked {
            if report.success {
                self.transition(descriptor, ServiceState::Stopped)?;
                self.update(&descriptor.id, |record| {
                    record.descriptor.pid = None;
                    record.last_error = None;
                });
            } else {
                self.transition(descriptor, ServiceState::Error)?;
                self.update(&descriptor.id, |record| record.last_error = report.message.clone());
            }
        }
        if let Some(guard) = guard {
            guard.disarm();
        }
        Ok(report)
    }

    async fn terminate(&self, host: &dyn ExecutionTarget, candidates: &[u32], killed: &mut Vec<u32>) -> Vec<u32> {
        let pending: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|pid| *pid > 1 && !killed.contains(pid))
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }
        let done = kill::terminate_all(host, &pending, self.policy).await;
        if done.len() < pending.len() {
            warn!(
                host = %host.identity(),
                candidates = ?pending,
                terminated = ?done,
                "Some processes could not be terminated"
            );
        }
        killed.extend(done.iter().copied());
        done
    }

    async fn hunt(&self, host: &dyn ExecutionTarget, target: &HuntTarget) -> StopReport {
        let mut killed = Vec::new();
        let mut steps = Vec::with_capacity(StopStep::ALL.len());

        // workers can die with their parent before a later scan sees them
        let before = probe::process_table(host).await;
        let captured = self.registry.list_processes(host).await;

        // 1. remembered pid and its descendants
        let mut tree: Vec<u32> = Vec::new();
        match target.pid {
            None => steps.push(StepOutcome::skipped(StopStep::ProcessTree, "no pid recorded")),
            Some(pid) => {
                let mut done = Vec::new();
                if before.is_empty() || before.iter().any(|p| p.pid == pid) {
                    tree = descendants(&before, pid);
                    // children first, then the process itself
                    done = self.terminate(host, &tree, &mut killed).await;
                    done.extend(self.terminate(host, &[pid], &mut killed).await);
                    tree.push(pid);
                } else {
                    debug!(host = %host.identity(), pid, "Recorded pid is not running");
                }
                steps.push(StepOutcome::ran(StopStep::ProcessTree, tree.clone(), done));
            }
        }

        // 2. command lines containing the model path
        match &target.model_path {
            None => steps.push(StepOutcome::skipped(StopStep::ModelPath, "no model path")),
            Some(model) => {
                let candidates: Vec<u32> = probe::process_table(host)
                    .await
                    .into_iter()
                    .filter(|p| p.args.contains(model.as_str()) && !killed.contains(&p.pid))
                    .map(|p| p.pid)
                    .collect();
                let done = self.terminate(host, &candidates, &mut killed).await;
                steps.push(StepOutcome::ran(StopStep::ModelPath, candidates, done));
            }
        }

        // 3. listeners on the port
        let mut owners = Vec::new();
        match target.port {
            None => steps.push(StepOutcome::skipped(StopStep::Port, "no port")),
            Some(port) => {
                owners = probe::port_owners(host, port).await;
                let candidates: Vec<u32> = owners.iter().copied().filter(|pid| !killed.contains(pid)).collect();
                let done = self.terminate(host, &candidates, &mut killed).await;
                steps.push(StepOutcome::ran(StopStep::Port, candidates, done));
            }
        }

        // 4. framework keyword, or the command signature when the framework is unknown
        if target.keyword.is_none() && target.signature.is_none() {
            steps.push(StepOutcome::skipped(StopStep::FrameworkPattern, "no command to match"));
        } else {
            let candidates: Vec<u32> = probe::process_table(host)
                .await
                .into_iter()
                .filter(|p| !killed.contains(&p.pid) && self.matches_target(target, &p.args))
                .map(|p| p.pid)
                .collect();
            let done = self.terminate(host, &candidates, &mut killed).await;
            steps.push(StepOutcome::ran(StopStep::FrameworkPattern, candidates, done));
        }

        // 5. accelerator processes seen before the cascade started
        let family: BTreeSet<u32> = killed.iter().flat_map(|pid| descendants(&before, *pid)).collect();
        if captured.is_empty() {
            steps.push(StepOutcome::skipped(
                StopStep::CapturedAccelerator,
                "no accelerator processes captured",
            ));
        } else {
            let candidates: Vec<u32> = captured
                .iter()
                .filter(|p| !killed.contains(&p.pid))
                .filter(|p| {
                    tree.contains(&p.pid)
                        || owners.contains(&p.pid)
                        || family.contains(&p.pid)
                        || self.accelerator_process_matches(target, p, &before)
                })
                .map(|p| p.pid)
                .collect();
            let done = self.terminate(host, &candidates, &mut killed).await;
            steps.push(StepOutcome::ran(StopStep::CapturedAccelerator, candidates, done));
        }

        // 6. anything on an accelerator still referencing the framework or model
        if target.keyword.is_none() && target.model_path.is_none() {
            steps.push(StepOutcome::skipped(StopStep::AcceleratorSweep, "no keyword or model path"));
        } else {
            let candidates: Vec<u32> = self
                .registry
                .list_processes(host)
                .await
                .iter()
                .filter(|p| !killed.contains(&p.pid))
                .filter(|p| {
                    let line = p.command_line();
                    target.keyword.as_deref().is_some_and(|k| self.matcher.matches_keyword(k, None, line))
                        || target.model_path.as_deref().is_some_and(|m| line.contains(m))
                })
                .map(|p| p.pid)
                .collect();
            let done = self.terminate(host, &candidates, &mut killed).await;
            steps.push(StepOutcome::ran(StopStep::AcceleratorSweep, candidates, done));
        }

        let found: BTreeSet<u32> = steps.iter().flat_map(|s| s.candidates.iter().copied()).collect();
        let success = !killed.is_empty() || found.is_empty();
        let port_released = match target.port {
            Some(port) => Some(!probe::is_port_listening(host, port).await),
            None => None,
        };

        StopReport {
            service_id: String::new(),
            success,
            message: (!success).then(|| {
                format!(
                    "Found {} candidate process(es) but none could be terminated",
                    found.len()
                )
            }),
            killed,
            steps,
            port_released,
        }
    }

    fn matches_target(&self, target: &HuntTarget, command_line: &str) -> bool {
        match (&target.keyword, &target.signature) {
            (Some(keyword), _) => self.matcher.matches_keyword(keyword, target.port, command_line),
            (None, Some(signature)) => self.matcher.matches_signature(signature, command_line),
            (None, None) => false,
        }
    }

    /// A captured accelerator process belongs to the service when its
    /// command line (from the capture, or the earlier process table)
    /// matches the model path, keyword or signature
    fn accelerator_process_matches(&self, target: &HuntTarget, process: &AcceleratorProcess, before: &[ProcessInfo]) -> bool {
        let from_table = before.iter().find(|p| p.pid == process.pid).map(|p| p.args.as_str());
        [Some(process.command_line()), from_table]
            .into_iter()
            .flatten()
            .any(|line| {
                target.model_path.as_deref().is_some_and(|m| line.contains(m)) || self.matches_target(target, line)
            })
    }

    /// Re-probe the host without changing the recorded state
    pub async fn status(&self, descriptor: &ServiceDescriptor) -> Result<ServiceStatus> {
        let parsed = ParsedCommand::parse(&descriptor.start_command)?;
        let host = self.resolver.resolve(&descriptor.server_id).await?;
        let port = descriptor.port.or(parsed.port);

        let observation = self.observe(host.as_ref(), &parsed.signature, port).await;
        let known = descriptor.pid.or_else(|| self.pid(&descriptor.id));
        let running = observation.is_running();
        let pid = if running { observation.choose_pid(known) } else { None };

        if let Some(pid) = pid {
            self.update(&descriptor.id, |record| {
                if record.state == ServiceState::Running {
                    record.descriptor.pid = Some(pid);
                }
            });
        }

        Ok(ServiceStatus {
            service_id: descriptor.id.clone(),
            state: self.state(&descriptor.id),
            observed: if running {
                ObservedState::Running
            } else {
                ObservedState::Stopped
            },
            pid,
            port,
            port_listening: observation.listening,
            matching_pids: observation.matching,
        })
    }

    /// Last `lines` lines of the service log
    pub async fn tail_log(&self, descriptor: &ServiceDescriptor, lines: usize) -> Result<String> {
        let host = self.resolver.resolve(&descriptor.server_id).await?;
        Ok(probe::tail_file(host.as_ref(), &self.log_path(descriptor), lines).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_core::{ChannelSubscriber, ExecutionResult};
    use serve_dev::{ScriptedTarget, StaticResolver};
    use std::time::Duration;

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            settle_delay_ms: 0,
            confirm_interval_ms: 0,
            kill_grace_ms: 0,
            ..LifecycleConfig::default()
        }
    }

    fn manager(host: Arc<ScriptedTarget>) -> ServiceLifecycleManager {
        let resolver = StaticResolver::new().with_target("gpu1", host);
        ServiceLifecycleManager::new(Arc::new(resolver), Arc::new(AcceleratorRegistry::default()), config())
    }

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("llm", "gpu1", "python server.py --port 9000")
    }

    #[test]
    fn test_compose_inner() {
        let parsed =
            ParsedCommand::parse("cd /srv && export CUDA_VISIBLE_DEVICES=0 && python server.py --port 9000 &").unwrap();

        assert_eq!(
            compose_inner(&parsed, &Activation::None),
            "cd '/srv' && export CUDA_VISIBLE_DEVICES='0' && exec python server.py --port 9000"
        );

        let conda = Activation::Conda {
            tool: "/opt/conda/bin/conda".into(),
            env: "serving".into(),
        };
        assert!(compose_inner(&parsed, &conda)
            .ends_with("exec '/opt/conda/bin/conda' run --no-capture-output -n 'serving' python server.py --port 9000"));

        let venv = Activation::Venv("~/venvs/llm".into());
        assert!(compose_inner(&parsed, &venv).contains(". \"$HOME\"/'venvs/llm/bin/activate' && exec python"));
    }

    #[test]
    fn test_launch_command_quotes_inner() {
        let command = launch_command("export A='x' && exec python a.py", "~/.servectl/logs/a.log");
        assert_eq!(
            command,
            r#"nohup sh -c 'export A='\''x'\'' && exec python a.py' > "$HOME"/'.servectl/logs/a.log' 2>&1 < /dev/null & echo $!"#
        );
    }

    #[test]
    fn test_log_path_default() {
        let host = Arc::new(ScriptedTarget::new());
        let manager = manager(host);

        assert_eq!(manager.log_path(&descriptor()), "~/.servectl/logs/llm.log");
        assert_eq!(manager.log_path(&descriptor().with_log_path("/tmp/x.log")), "/tmp/x.log");
    }

    #[tokio::test]
    async fn test_port_in_use_fails_fast_with_error_state() {
        let host = Arc::new(
            ScriptedTarget::new()
                .on("mkdir -p", ExecutionResult::ok(""))
                .on("ss -ltnH", ExecutionResult::ok("LISTEN 0 128 0.0.0.0:9000 0.0.0.0:*\n"))
                .on("tail -n", ExecutionResult::ok("")),
        );
        let (subscriber, mut errors) = ChannelSubscriber::channel();
        let bus = ErrorBus::new();
        let _subscription = bus.subscribe(subscriber);
        let manager = manager(Arc::clone(&host)).with_error_bus(bus);

        let report = manager.start(&descriptor()).await.unwrap();

        assert_eq!(report.state, ServiceState::Error);
        assert!(report.message.unwrap().contains("Port 9000 is already in use"));
        assert_eq!(manager.state("llm"), Some(ServiceState::Error));
        assert_eq!(host.calls_matching("nohup"), 0);
        assert!(errors.try_recv().unwrap().source.unwrap().starts_with("service:llm"));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_errors() {
        let host = Arc::new(ScriptedTarget::new());
        let manager = manager(host);

        let unknown = ServiceDescriptor::new("llm", "nowhere", "python server.py");
        assert!(matches!(manager.start(&unknown).await, Err(LifecycleError::Core(_))));
        assert_eq!(manager.state("llm"), None);

        let empty = ServiceDescriptor::new("llm", "gpu1", "export A=1");
        assert!(matches!(manager.start(&empty).await, Err(LifecycleError::InvalidCommand(_))));
    }

    #[tokio::test]
    async fn test_start_requires_stopped_or_error() {
        let host = Arc::new(ScriptedTarget::new().on("mkdir -p", ExecutionResult::ok("")));
        let manager = manager(host);
        manager.transition(&descriptor(), ServiceState::Starting).unwrap();

        let result = manager.start(&descriptor()).await;
        assert!(matches!(
            result,
            Err(LifecycleError::InvalidTransition {
                from: ServiceState::Starting,
                ..
            })
        ));
        assert!(manager.stop(&descriptor()).await.is_err());
        assert!(!manager.forget("llm"));
    }

    #[tokio::test]
    async fn test_cancelled_start_does_not_wedge_service() {
        let host = Arc::new(
            ScriptedTarget::new()
                .on_delayed("mkdir -p", Duration::from_millis(500), ExecutionResult::ok(""))
                .on("ps -eo", ExecutionResult::ok("    1     0 /sbin/init\n")),
        );
        let manager = manager(host);

        let cancelled = tokio::time::timeout(Duration::from_millis(20), manager.start(&descriptor())).await;
        assert!(cancelled.is_err());

        assert_eq!(manager.state("llm"), Some(ServiceState::Error));
        let snapshot = manager.list_services().remove(0);
        assert_eq!(snapshot.last_error.as_deref(), Some("start cancelled"));

        assert!(manager.stop(&descriptor()).await.unwrap().success);
        assert_eq!(manager.state("llm"), Some(ServiceState::Stopped));
        assert!(manager.forget("llm"));
    }

    #[tokio::test]
    async fn test_cancelled_stop_does_not_wedge_service() {
        let host = Arc::new(ScriptedTarget::new().on_delayed(
            "ps -eo",
            Duration::from_millis(500),
            ExecutionResult::ok("    1     0 /sbin/init\n"),
        ));
        let manager = manager(host);
        manager.transition(&descriptor(), ServiceState::Starting).unwrap();
        manager.transition(&descriptor(), ServiceState::Running).unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(20), manager.stop(&descriptor())).await;
        assert!(cancelled.is_err());

        assert_eq!(manager.state("llm"), Some(ServiceState::Error));
        assert!(manager.forget("llm"));
    }

    #[tokio::test]
    async fn test_process_tree_children_die_before_parent() {
        let host = Arc::new(
            ScriptedTarget::new()
                .on(
                    "ps -eo",
                    ExecutionResult::ok("  500     1 python server.py --port 9000\n  501   500 python worker.py\n"),
                )
                .on("kill -TERM", ExecutionResult::ok("ok"))
                .on("kill -0", ExecutionResult::from_exit(1, "", "")),
        );
        let manager = manager(Arc::clone(&host));

        let report = manager.stop(&descriptor().with_pid(500)).await.unwrap();

        assert_eq!(report.step(StopStep::ProcessTree).unwrap().killed, vec![501, 500]);
        let calls = host.calls();
        let position = |needle: &str| calls.iter().position(|c| c.contains(needle)).unwrap();
        assert!(position("kill -TERM 501") < position("kill -TERM 500"));
    }

    #[tokio::test]
    async fn test_stop_with_nothing_running_succeeds() {
        let host = Arc::new(ScriptedTarget::new().on("ps -eo", ExecutionResult::ok("    1     0 /sbin/init\n")));
        let manager = manager(Arc::clone(&host));

        let report = manager.stop(&descriptor().with_pid(4242)).await.unwrap();

        assert!(report.success);
        assert!(report.already_stopped());
        assert!(report.killed.is_empty());
        assert_eq!(report.steps.len(), 6);
        assert!(report.step(StopStep::ModelPath).unwrap().skipped.is_some());
        assert_eq!(report.port_released, Some(true));
        assert_eq!(host.calls_matching("kill -TERM"), 0);
        // untracked services keep no state
        assert_eq!(manager.state("llm"), None);
    }

    #[tokio::test]
    async fn test_stop_reports_failure_when_nothing_dies() {
        let host = Arc::new(
            ScriptedTarget::new()
                .on("ps -eo", ExecutionResult::ok("  500     1 python server.py --port 9000\n"))
                .on("kill -TERM 500", ExecutionResult::from_exit(1, "", "Operation not permitted")),
        );
        let manager = manager(host);

        let report = manager.stop(&descriptor()).await.unwrap();

        assert!(!report.success);
        assert!(report.message.as_ref().unwrap().contains("none could be terminated"));
        assert_eq!(report.step(StopStep::FrameworkPattern).unwrap().candidates, vec![500]);
    }
}
