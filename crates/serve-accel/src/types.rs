//! Accelerator inventory types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Accelerator vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
}

impl Vendor {
    /// Detection order
    pub const PRIORITY: [Vendor; 3] = [Vendor::Nvidia, Vendor::Amd, Vendor::Intel];

    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::Nvidia => "nvidia",
            Vendor::Amd => "amd",
            Vendor::Intel => "intel",
        }
    }

    /// Command-line management tool for this vendor
    pub fn tool(self) -> &'static str {
        match self {
            Vendor::Nvidia => "nvidia-smi",
            Vendor::Amd => "rocm-smi",
            Vendor::Intel => "xpu-smi",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accelerator as reported by a single query. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorDevice {
    pub id: u32,
    pub vendor: Vendor,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_percent: Option<f32>,
    pub temperature_c: Option<f32>,
}

impl AcceleratorDevice {
    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }
}

/// A process occupying an accelerator. Re-queried on every use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorProcess {
    pub pid: u32,
    pub name: String,
    /// Full command line, when it could be resolved
    pub command: String,
    pub memory_used_mb: u64,
    pub vendor: Vendor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<u32>,
}

impl AcceleratorProcess {
    /// Best text to match against: the full command line, else the name
    pub fn command_line(&self) -> &str {
        if self.command.trim().is_empty() {
            &self.name
        } else {
            &self.command
        }
    }
}

/// Totals over one device query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorSummary {
    pub vendor: Vendor,
    pub device_count: usize,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub average_utilization_percent: Option<f32>,
}

impl AcceleratorSummary {
    pub fn from_devices(vendor: Vendor, devices: &[AcceleratorDevice]) -> Self {
        let utilizations: Vec<f32> = devices.iter().filter_map(|d| d.utilization_percent).collect();
        let average_utilization_percent = if utilizations.is_empty() {
            None
        } else {
            Some(utilizations.iter().sum::<f32>() / utilizations.len() as f32)
        };

        Self {
            vendor,
            device_count: devices.len(),
            memory_total_mb: devices.iter().map(|d| d.memory_total_mb).sum(),
            memory_used_mb: devices.iter().map(|d| d.memory_used_mb).sum(),
            average_utilization_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: u32, total: u64, used: u64, util: Option<f32>) -> AcceleratorDevice {
        AcceleratorDevice {
            id,
            vendor: Vendor::Nvidia,
            name: "NVIDIA A100-SXM4-80GB".to_string(),
            uuid: None,
            memory_total_mb: total,
            memory_used_mb: used,
            utilization_percent: util,
            temperature_c: None,
        }
    }

    #[test]
    fn test_summary_totals() {
        let devices = vec![
            device(0, 81920, 1024, Some(10.0)),
            device(1, 81920, 2048, Some(30.0)),
            device(2, 81920, 0, None),
        ];
        let summary = AcceleratorSummary::from_devices(Vendor::Nvidia, &devices);

        assert_eq!(summary.device_count, 3);
        assert_eq!(summary.memory_total_mb, 245760);
        assert_eq!(summary.memory_used_mb, 3072);
        assert_eq!(summary.average_utilization_percent, Some(20.0));
        assert_eq!(devices[1].memory_free_mb(), 79872);
    }

    #[test]
    fn test_vendor_priority_and_serde() {
        assert_eq!(Vendor::PRIORITY[0], Vendor::Nvidia);
        assert_eq!(Vendor::Amd.tool(), "rocm-smi");
        assert_eq!(serde_json::to_string(&Vendor::Intel).unwrap(), "\"intel\"");
    }

    #[test]
    fn test_command_line_falls_back_to_name() {
        let process = AcceleratorProcess {
            pid: 42,
            name: "python3".to_string(),
            command: String::new(),
            memory_used_mb: 0,
            vendor: Vendor::Amd,
            device_id: None,
        };
        assert_eq!(process.command_line(), "python3");
    }
}
