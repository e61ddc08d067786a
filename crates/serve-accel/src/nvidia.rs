//! NVIDIA backend over `nvidia-smi`

use crate::handler::{parse_number, query, resolve_commands, AcceleratorHandler, KillPolicy};
use crate::{AccelError, AcceleratorDevice, AcceleratorProcess, Result, Vendor};
use async_trait::async_trait;
use serve_core::ExecutionTarget;
use std::collections::HashMap;
use tracing::warn;

pub const PROBE: &str = "command -v nvidia-smi >/dev/null 2>&1 && nvidia-smi -L";

pub const QUERY_DEVICES: &str = "nvidia-smi --query-gpu=index,uuid,name,memory.total,memory.used,utilization.gpu,temperature.gpu --format=csv,noheader,nounits";

pub const QUERY_PROCESSES: &str =
    "nvidia-smi --query-compute-apps=pid,gpu_uuid,process_name,used_memory --format=csv,noheader,nounits";

/// NVIDIA handler
#[derive(Debug, Clone, Default)]
pub struct NvidiaHandler {
    policy: KillPolicy,
}

impl NvidiaHandler {
    pub fn new(policy: KillPolicy) -> Self {
        Self { policy }
    }
}

/// Parse `--query-gpu` CSV rows
pub fn parse_devices(output: &str) -> Result<Vec<AcceleratorDevice>> {
    let mut devices = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 7 {
            continue;
        }
        let Ok(id) = fields[0].parse::<u32>() else {
            continue;
        };
        devices.push(AcceleratorDevice {
            id,
            vendor: Vendor::Nvidia,
            name: fields[2].to_string(),
            uuid: Some(fields[1].to_string()).filter(|u| !u.is_empty()),
            memory_total_mb: parse_number(fields[3]).unwrap_or(0.0) as u64,
            memory_used_mb: parse_number(fields[4]).unwrap_or(0.0) as u64,
            utilization_percent: parse_number(fields[5]).map(|v| v as f32),
            temperature_c: parse_number(fields[6]).map(|v| v as f32),
        });
    }

    if devices.is_empty() && !output.trim().is_empty() {
        return Err(AccelError::parse("nvidia-smi", "no device rows"));
    }
    Ok(devices)
}

/// Parse `--query-compute-apps` CSV rows. `devices` maps GPU uuids back to
/// indices.
pub fn parse_processes(output: &str, devices: &[AcceleratorDevice]) -> Result<Vec<AcceleratorProcess>> {
    let by_uuid: HashMap<&str, u32> = devices
        .iter()
        .filter_map(|d| d.uuid.as_deref().map(|uuid| (uuid, d.id)))
        .collect();

    let mut processes = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            continue;
        }
        let Ok(pid) = fields[0].parse::<u32>() else {
            continue;
        };
        processes.push(AcceleratorProcess {
            pid,
            name: fields[2].to_string(),
            command: String::new(),
            memory_used_mb: parse_number(fields[3]).unwrap_or(0.0) as u64,
            vendor: Vendor::Nvidia,
            device_id: by_uuid.get(fields[1]).copied(),
        });
    }

    if processes.is_empty() && !output.trim().is_empty() && !output.contains("No running") {
        return Err(AccelError::parse("nvidia-smi", "no process rows"));
    }
    Ok(processes)
}

#[async_trait]
impl AcceleratorHandler for NvidiaHandler {
    fn vendor(&self) -> Vendor {
        Vendor::Nvidia
    }

    fn kill_policy(&self) -> KillPolicy {
        self.policy
    }

    async fn is_available(&self, host: &dyn ExecutionTarget) -> bool {
        let result = host.run(PROBE).await;
        result.success && result.stdout.contains("GPU ")
    }

    async fn list_devices(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorDevice> {
        let Some(output) = query(host, Vendor::Nvidia, QUERY_DEVICES).await else {
            return Vec::new();
        };
        parse_devices(&output).unwrap_or_else(|e| {
            warn!(host = %host.identity(), "{}", e);
            Vec::new()
        })
    }

    async fn list_processes(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorProcess> {
        let devices = self.list_devices(host).await;
        let Some(output) = query(host, Vendor::Nvidia, QUERY_PROCESSES).await else {
            return Vec::new();
        };

        let mut processes = parse_processes(&output, &devices).unwrap_or_else(|e| {
            warn!(host = %host.identity(), "{}", e);
            Vec::new()
        });
        resolve_commands(host, &mut processes).await;
        processes
    }
}
