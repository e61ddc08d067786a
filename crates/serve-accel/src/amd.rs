//! AMD backend over `rocm-smi`

use crate::handler::{parse_number, query, resolve_commands, AcceleratorHandler, KillPolicy};
use crate::{AccelError, AcceleratorDevice, AcceleratorProcess, Result, Vendor};
use async_trait::async_trait;
use regex::Regex;
use serve_core::ExecutionTarget;
use std::sync::LazyLock;
use tracing::warn;

pub const PROBE: &str = "command -v rocm-smi >/dev/null 2>&1 && rocm-smi --showid --csv";

pub const QUERY_DEVICES: &str = "rocm-smi --showproductname --showmeminfo vram --showuse --showtemp --csv";

pub const QUERY_PROCESSES: &str = "rocm-smi --showpids";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// `PID  NAME  GPU(s)  VRAM_USED ...`
static PID_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s+(\S+)\s+(\d+)\s+(\d+)").expect("valid regex"));

static CARD_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^card(\d+)$").expect("valid regex"));

/// AMD handler
#[derive(Debug, Clone, Default)]
pub struct AmdHandler {
    policy: KillPolicy,
}

impl AmdHandler {
    pub fn new(policy: KillPolicy) -> Self {
        Self { policy }
    }
}

fn column(header: &[String], needles: &[&str]) -> Option<usize> {
    needles
        .iter()
        .find_map(|needle| header.iter().position(|h| h.contains(needle)))
}

/// Parse the CSV device report. Column order varies between ROCm releases,
/// so columns are located by header text.
pub fn parse_devices(output: &str) -> Result<Vec<AcceleratorDevice>> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let Some(header_line) = lines.by_ref().find(|l| l.to_lowercase().starts_with("device")) else {
        if output.trim().is_empty() {
            return Ok(Vec::new());
        }
        return Err(AccelError::parse("rocm-smi", "missing CSV header"));
    };

    let header: Vec<String> = header_line.split(',').map(|h| h.trim().to_lowercase()).collect();
    let name_col = column(&header, &["card series", "card model", "product name"]);
    let temp_col = column(&header, &["temperature"]);
    let use_col = column(&header, &["gpu use"]);
    let total_col = column(&header, &["vram total memory"]);
    let used_col = column(&header, &["vram total used"]);

    let mut devices = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let Some(id) = fields
            .first()
            .and_then(|f| CARD_ID.captures(f))
            .and_then(|c| c[1].parse::<u32>().ok())
        else {
            continue;
        };
        let field = |col: Option<usize>| col.and_then(|c| fields.get(c)).copied();

        devices.push(AcceleratorDevice {
            id,
            vendor: Vendor::Amd,
            name: field(name_col).unwrap_or("AMD GPU").to_string(),
            uuid: None,
            memory_total_mb: field(total_col)
                .and_then(parse_number)
                .map(|b| (b / BYTES_PER_MB) as u64)
                .unwrap_or(0),
            memory_used_mb: field(used_col)
                .and_then(parse_number)
                .map(|b| (b / BYTES_PER_MB) as u64)
                .unwrap_or(0),
            utilization_percent: field(use_col).and_then(parse_number).map(|v| v as f32),
            temperature_c: field(temp_col).and_then(parse_number).map(|v| v as f32),
        });
    }
    Ok(devices)
}

/// Parse the `--showpids` table
pub fn parse_processes(output: &str) -> Vec<AcceleratorProcess> {
    output
        .lines()
        .filter_map(|line| PID_ROW.captures(line))
        .filter_map(|caps| {
            Some(AcceleratorProcess {
                pid: caps[1].parse().ok()?,
                name: caps[2].to_string(),
                command: String::new(),
                memory_used_mb: caps[4]
                    .parse::<f64>()
                    .map(|b| (b / BYTES_PER_MB) as u64)
                    .unwrap_or(0),
                vendor: Vendor::Amd,
                device_id: None,
            })
        })
        .collect()
}

#[async_trait]
impl AcceleratorHandler for AmdHandler {
    fn vendor(&self) -> Vendor {
        Vendor::Amd
    }

    fn kill_policy(&self) -> KillPolicy {
        self.policy
    }

    async fn is_available(&self, host: &dyn ExecutionTarget) -> bool {
        let result = host.run(PROBE).await;
        result.success && result.stdout.to_lowercase().contains("card")
    }

    async fn list_devices(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorDevice> {
        let Some(output) = query(host, Vendor::Amd, QUERY_DEVICES).await else {
            return Vec::new();
        };
        parse_devices(&output).unwrap_or_else(|e| {
            warn!(host = %host.identity(), "{}", e);
            Vec::new()
        })
    }

    async fn list_processes(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorProcess> {
        let Some(output) = query(host, Vendor::Amd, QUERY_PROCESSES).await else {
            return Vec::new();
        };
        let mut processes = parse_processes(&output);
        resolve_commands(host, &mut processes).await;
        processes
    }
}
