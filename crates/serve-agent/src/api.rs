//! Inbound API. Every call returns an [`ApiResponse`]; failures are
//! reported in the response, never raised.

use crate::context::AppContext;
use crate::sysinfo::{self, SystemInfo};
use serde::{Deserialize, Serialize};
use serve_accel::{AcceleratorDevice, AcceleratorProcess, AcceleratorSummary, Vendor};
use serve_core::{ErrorClassifier, ExecOptions, ExecutionResult, ExecutionTarget, ServerEntry};
use serve_exec::PoolEntryInfo;
use serve_lifecycle::{ServiceDescriptor, ServiceSnapshot, ServiceStatus, StartReport, StopReport};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Tagged result returned across the API boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }

    /// A failed call that still carries a payload worth showing
    pub fn failed_with(data: T, error: impl fmt::Display) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(error.to_string()),
        }
    }

    pub fn from_result<E: fmt::Display>(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e),
        }
    }

    pub fn into_result(self) -> std::result::Result<Option<T>, String> {
        match self.error {
            Some(error) if !self.success => Err(error),
            _ if !self.success => Err("request failed".to_string()),
            _ => Ok(self.data),
        }
    }
}

/// Configured server, without its credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl From<&ServerEntry> for ServerSummary {
    fn from(entry: &ServerEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            host: entry.host.clone(),
            port: entry.port,
            username: entry.username.clone(),
        }
    }
}

/// Outcome of a connectivity check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCheck {
    pub server_id: String,
    pub host: String,
    pub connected: bool,
    pub latency_ms: u64,
}

/// Detected vendor with its devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorInventory {
    pub vendor: Option<Vendor>,
    pub devices: Vec<AcceleratorDevice>,
    pub summary: Option<AcceleratorSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillOutcome {
    pub requested: Vec<u32>,
    pub killed: Vec<u32>,
}

impl KillOutcome {
    pub fn survivors(&self) -> Vec<u32> {
        self.requested.iter().copied().filter(|pid| !self.killed.contains(pid)).collect()
    }
}

/// Operations exposed to the UI and the CLI
#[derive(Clone)]
pub struct ServeApi {
    context: Arc<AppContext>,
}

impl ServeApi {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    pub fn list_servers(&self) -> ApiResponse<Vec<ServerSummary>> {
        ApiResponse::ok(self.context.servers().entries().iter().map(ServerSummary::from).collect())
    }

    /// Run `command` on `server_id`. The response carries the full
    /// result even when the command failed.
    pub async fn execute(&self, server_id: &str, command: &str, options: &ExecOptions) -> ApiResponse<ExecutionResult> {
        let target = match self.context.target(server_id).await {
            Ok(target) => target,
            Err(e) => return ApiResponse::err(e),
        };

        let result = target.execute(command, options).await;
        if result.success {
            ApiResponse::ok(result)
        } else {
            let error = result.error_text().to_string();
            ApiResponse::failed_with(result, error)
        }
    }

    /// Dial `server_id`, run `echo ok` and report the round trip.
    /// Failures are classified and published on the error bus.
    pub async fn test_connection(&self, server_id: &str) -> ApiResponse<ConnectionCheck> {
        let target = match self.context.target(server_id).await {
            Ok(target) => target,
            Err(e) => return ApiResponse::err(e),
        };

        let started = Instant::now();
        let result = target.run("echo ok").await;
        let check = ConnectionCheck {
            server_id: server_id.to_string(),
            host: target.identity().to_string(),
            connected: result.success && result.stdout.trim() == "ok",
            latency_ms: started.elapsed().as_millis() as u64,
        };

        if check.connected {
            info!(server = server_id, latency_ms = check.latency_ms, "Connection test succeeded");
            return ApiResponse::ok(check);
        }

        let message = match result.error_text() {
            "" => format!("unexpected response: {}", result.stdout.trim()),
            text => text.to_string(),
        };
        let record = ErrorClassifier::record(&message).with_source(format!("server:{}", server_id));
        self.context.error_bus().publish(&record);
        ApiResponse::failed_with(check, format!("{}: {}", record.kind, message))
    }

    /// Close the pooled connection for `server_id`
    pub async fn disconnect(&self, server_id: &str) -> ApiResponse<bool> {
        match self.context.servers().identity(server_id) {
            Ok(identity) => ApiResponse::ok(self.context.pool().disconnect(&identity).await),
            Err(e) => ApiResponse::err(e),
        }
    }

    pub async fn connections(&self) -> ApiResponse<Vec<PoolEntryInfo>> {
        ApiResponse::ok(self.context.pool().snapshot().await)
    }

    pub async fn list_accelerators(&self, server_id: &str) -> ApiResponse<AcceleratorInventory> {
        let target = match self.context.target(server_id).await {
            Ok(target) => target,
            Err(e) => return ApiResponse::err(e),
        };
        let registry = self.context.accelerators();

        let vendor = registry.vendor(target.as_ref()).await;
        let devices = registry.list_devices(target.as_ref()).await;
        let summary = vendor.map(|vendor| AcceleratorSummary::from_devices(vendor, &devices));
        ApiResponse::ok(AcceleratorInventory {
            vendor,
            devices,
            summary,
        })
    }

    pub async fn list_accelerator_processes(&self, server_id: &str) -> ApiResponse<Vec<AcceleratorProcess>> {
        match self.context.target(server_id).await {
            Ok(target) => ApiResponse::ok(self.context.accelerators().list_processes(target.as_ref()).await),
            Err(e) => ApiResponse::err(e),
        }
    }

    pub async fn kill_accelerator_process(&self, server_id: &str, pid: u32) -> ApiResponse<bool> {
        let target = match self.context.target(server_id).await {
            Ok(target) => target,
            Err(e) => return ApiResponse::err(e),
        };

        if self.context.accelerators().kill_process(target.as_ref(), pid).await {
            ApiResponse::ok(true)
        } else {
            warn!(server = server_id, pid, "Accelerator process survived kill");
            ApiResponse::failed_with(false, format!("Failed to kill process {}", pid))
        }
    }

    /// Kill `pids` in batches; fails when any pid survives
    pub async fn kill_accelerator_processes(&self, server_id: &str, pids: &[u32]) -> ApiResponse<KillOutcome> {
        let target = match self.context.target(server_id).await {
            Ok(target) => target,
            Err(e) => return ApiResponse::err(e),
        };

        let killed = self.context.accelerators().kill_processes(target.as_ref(), pids).await;
        let outcome = KillOutcome {
            requested: pids.to_vec(),
            killed,
        };
        let survivors = outcome.survivors();
        if survivors.is_empty() {
            ApiResponse::ok(outcome)
        } else {
            let message = format!("Failed to kill processes: {:?}", survivors);
            ApiResponse::failed_with(outcome, message)
        }
    }

    pub async fn system_info(&self, server_id: &str) -> ApiResponse<SystemInfo> {
        match self.context.target(server_id).await {
            Ok(target) => {
                ApiResponse::ok(sysinfo::system_info(target.as_ref(), self.context.accelerators()).await)
            }
            Err(e) => ApiResponse::err(e),
        }
    }

    pub async fn start_service(&self, descriptor: &ServiceDescriptor) -> ApiResponse<StartReport> {
        match self.context.lifecycle().start(descriptor).await {
            Ok(report) if report.is_running() => ApiResponse::ok(report),
            Ok(report) => {
                let message = report
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Service {} did not start", descriptor.id));
                ApiResponse::failed_with(report, message)
            }
            Err(e) => ApiResponse::err(e),
        }
    }

    pub async fn stop_service(&self, descriptor: &ServiceDescriptor) -> ApiResponse<StopReport> {
        match self.context.lifecycle().stop(descriptor).await {
            Ok(report) if report.success => ApiResponse::ok(report),
            Ok(report) => {
                let message = report
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Service {} could not be stopped", descriptor.id));
                ApiResponse::failed_with(report, message)
            }
            Err(e) => ApiResponse::err(e),
        }
    }

    pub async fn service_status(&self, descriptor: &ServiceDescriptor) -> ApiResponse<ServiceStatus> {
        ApiResponse::from_result(self.context.lifecycle().status(descriptor).await)
    }

    /// Last `lines` lines of the service log, or the configured tail length
    pub async fn service_logs(&self, descriptor: &ServiceDescriptor, lines: Option<usize>) -> ApiResponse<String> {
        let lines = lines.unwrap_or(self.context.config().lifecycle.log_tail_lines);
        ApiResponse::from_result(self.context.lifecycle().tail_log(descriptor, lines).await)
    }

    pub fn list_services(&self) -> ApiResponse<Vec<ServiceSnapshot>> {
        ApiResponse::ok(self.context.lifecycle().list_services())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_serialization_omits_empty_fields() {
        let ok = serde_json::to_value(ApiResponse::ok(3)).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "data": 3}));

        let err = serde_json::to_value(ApiResponse::<u32>::err("Unknown server: gpu9")).unwrap();
        assert_eq!(err, serde_json::json!({"success": false, "error": "Unknown server: gpu9"}));
    }

    #[test]
    fn test_into_result() {
        assert_eq!(ApiResponse::ok("x").into_result(), Ok(Some("x")));
        assert_eq!(ApiResponse::<u8>::err("boom").into_result(), Err("boom".to_string()));
        assert_eq!(
            ApiResponse::failed_with(false, "kill failed").into_result(),
            Err("kill failed".to_string())
        );
    }

    #[test]
    fn test_kill_outcome_survivors() {
        let outcome = KillOutcome {
            requested: vec![10, 11, 12],
            killed: vec![11],
        };
        assert_eq!(outcome.survivors(), vec![10, 12]);
    }
}
