//! Intel backend over `xpu-smi` JSON output

use crate::handler::{query, resolve_commands, AcceleratorHandler, KillPolicy};
use crate::{AccelError, AcceleratorDevice, AcceleratorProcess, Result, Vendor};
use async_trait::async_trait;
use serde_json::Value;
use serve_core::ExecutionTarget;
use tracing::warn;

pub const PROBE: &str = "command -v xpu-smi >/dev/null 2>&1 && xpu-smi discovery -j";

pub const QUERY_DEVICES: &str = "xpu-smi discovery -j";

pub const QUERY_PROCESSES: &str = "xpu-smi ps -j";

pub fn stats_command(device_id: u32) -> String {
    format!("xpu-smi stats -d {} -j", device_id)
}

/// Intel handler
#[derive(Debug, Clone, Default)]
pub struct IntelHandler {
    policy: KillPolicy,
}

impl IntelHandler {
    pub fn new(policy: KillPolicy) -> Self {
        Self { policy }
    }
}

/// xpu-smi prints numbers either as JSON numbers or as strings
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse `discovery -j`. Memory used and utilization come from
/// [`apply_stats`].
pub fn parse_devices(output: &str) -> Result<Vec<AcceleratorDevice>> {
    let root: Value = serde_json::from_str(output)?;
    let list = root
        .get("device_list")
        .and_then(Value::as_array)
        .ok_or_else(|| AccelError::parse("xpu-smi", "missing device_list"))?;

    Ok(list
        .iter()
        .filter_map(|device| {
            let id = device.get("device_id").and_then(as_f64)? as u32;
            Some(AcceleratorDevice {
                id,
                vendor: Vendor::Intel,
                name: device
                    .get("device_name")
                    .and_then(Value::as_str)
                    .unwrap_or("Intel GPU")
                    .to_string(),
                uuid: device.get("uuid").and_then(Value::as_str).map(str::to_string),
                memory_total_mb: device
                    .get("memory_physical_size_byte")
                    .and_then(as_f64)
                    .map(|b| (b / (1024.0 * 1024.0)) as u64)
                    .unwrap_or(0),
                memory_used_mb: 0,
                utilization_percent: None,
                temperature_c: None,
            })
        })
        .collect())
}

/// Merge `stats -d N -j` metrics into `device`
pub fn apply_stats(device: &mut AcceleratorDevice, output: &str) -> Result<()> {
    let root: Value = serde_json::from_str(output)?;
    let metrics = root
        .get("device_level")
        .and_then(Value::as_array)
        .ok_or_else(|| AccelError::parse("xpu-smi", "missing device_level"))?;

    for metric in metrics {
        let Some(kind) = metric.get("metrics_type").and_then(Value::as_str) else {
            continue;
        };
        let Some(value) = metric.get("value").and_then(as_f64) else {
            continue;
        };
        match kind {
            "XPUM_STATS_GPU_UTILIZATION" => device.utilization_percent = Some(value as f32),
            "XPUM_STATS_MEMORY_USED" => device.memory_used_mb = value as u64,
            "XPUM_STATS_GPU_CORE_TEMPERATURE" => device.temperature_c = Some(value as f32),
            _ => {}
        }
    }
    Ok(())
}

/// Parse `ps -j`; `mem_size` is reported in KiB
pub fn parse_processes(output: &str) -> Result<Vec<AcceleratorProcess>> {
    let root: Value = serde_json::from_str(output)?;
    let list = root
        .get("device_util_by_proc_list")
        .and_then(Value::as_array)
        .ok_or_else(|| AccelError::parse("xpu-smi", "missing device_util_by_proc_list"))?;

    Ok(list
        .iter()
        .filter_map(|entry| {
            Some(AcceleratorProcess {
                pid: entry.get("process_id").and_then(as_f64)? as u32,
                name: entry
                    .get("process_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                command: String::new(),
                memory_used_mb: entry.get("mem_size").and_then(as_f64).map(|k| (k / 1024.0) as u64).unwrap_or(0),
                vendor: Vendor::Intel,
                device_id: entry.get("device_id").and_then(as_f64).map(|d| d as u32),
            })
        })
        .collect())
}

#[async_trait]
impl AcceleratorHandler for IntelHandler {
    fn vendor(&self) -> Vendor {
        Vendor::Intel
    }

    fn kill_policy(&self) -> KillPolicy {
        self.policy
    }

    async fn is_available(&self, host: &dyn ExecutionTarget) -> bool {
        let result = host.run(PROBE).await;
        result.success && result.stdout.contains("device_list")
    }

    async fn list_devices(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorDevice> {
        let Some(output) = query(host, Vendor::Intel, QUERY_DEVICES).await else {
            return Vec::new();
        };
        let mut devices = match parse_devices(&output) {
            Ok(devices) => devices,
            Err(e) => {
                warn!(host = %host.identity(), "{}", e);
                return Vec::new();
            }
        };

        for device in devices.iter_mut() {
            if let Some(stats) = query(host, Vendor::Intel, &stats_command(device.id)).await {
                if let Err(e) = apply_stats(device, &stats) {
                    warn!(host = %host.identity(), device = device.id, "{}", e);
                }
            }
        }
        devices
    }

    async fn list_processes(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorProcess> {
        let Some(output) = query(host, Vendor::Intel, QUERY_PROCESSES).await else {
            return Vec::new();
        };
        let mut processes = parse_processes(&output).unwrap_or_else(|e| {
            warn!(host = %host.identity(), "{}", e);
            Vec::new()
        });
        resolve_commands(host, &mut processes).await;
        processes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_core::ExecutionResult;
    use serve_dev::ScriptedTarget;

    const DISCOVERY: &str = r#"{
        "device_list": [
            {"device_id": 0, "device_name": "Intel(R) Data Center GPU Max 1550",
             "uuid": "01000000-0000-0000-0000-000000000001",
             "memory_physical_size_byte": "68719476736"}
        ]
    }"#;

    const STATS: &str = r#"{
        "device_id": 0,
        "device_level": [
            {"metrics_type": "XPUM_STATS_GPU_UTILIZATION", "value": 37},
            {"metrics_type": "XPUM_STATS_MEMORY_USED", "value": 2048},
            {"metrics_type": "XPUM_STATS_GPU_CORE_TEMPERATURE", "value": 52.5}
        ]
    }"#;

    const PS: &str = r#"{
        "device_util_by_proc_list": [
            {"process_id": 9001, "process_name": "python", "device_id": 0, "mem_size": 1048576}
        ]
    }"#;

    #[test]
    fn test_parse_devices_and_stats() {
        let mut devices = parse_devices(DISCOVERY).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].memory_total_mb, 65536);

        apply_stats(&mut devices[0], STATS).unwrap();
        assert_eq!(devices[0].utilization_percent, Some(37.0));
        assert_eq!(devices[0].memory_used_mb, 2048);
        assert_eq!(devices[0].temperature_c, Some(52.5));
    }

    #[test]
    fn test_parse_processes() {
        let processes = parse_processes(PS).unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 9001);
        assert_eq!(processes[0].memory_used_mb, 1024);
        assert_eq!(processes[0].device_id, Some(0));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(parse_devices("not json").is_err());
        assert!(parse_processes("{}").is_err());
    }

    #[tokio::test]
    async fn test_handler_merges_stats() {
        let host = ScriptedTarget::new()
            .on(QUERY_DEVICES, ExecutionResult::ok(DISCOVERY))
            .on("xpu-smi stats -d 0 -j", ExecutionResult::ok(STATS));
        let handler = IntelHandler::default();

        let devices = handler.list_devices(&host).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].memory_used_mb, 2048);
    }
}
