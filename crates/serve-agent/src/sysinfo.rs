//! Memory and disk queries over the shell

use regex::Regex;
use serde::{Deserialize, Serialize};
use serve_accel::{AcceleratorRegistry, AcceleratorSummary};
use serve_core::ExecutionTarget;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

/// `free -b`, falling back to the raw meminfo table
pub const MEMORY_COMMAND: &str = "free -b 2>/dev/null || cat /proc/meminfo";

pub const DISK_COMMAND: &str = "df -P -B1 2>/dev/null";

static FREE_MEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Mem:\s+(\d+)\s+(\d+)\s+(\d+)(?:\s+\d+\s+\d+\s+(\d+))?").expect("valid regex")
});

static FREE_SWAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Swap:\s+(\d+)\s+(\d+)").expect("valid regex"));

static MEMINFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\w+):\s+(\d+)(?:\s+kB)?\s*$").expect("valid regex"));

static DF_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+(\d+)\s+(\d+)\s+(\d+)\s+(\d+)%\s+(.+)$").expect("valid regex")
});

/// Memory totals in bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<u64>,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

impl MemoryInfo {
    /// Parse `free -b` output, or `/proc/meminfo` when the `Mem:` row is absent
    pub fn parse(output: &str) -> Option<Self> {
        Self::parse_free(output).or_else(|| Self::parse_meminfo(output))
    }

    fn parse_free(output: &str) -> Option<Self> {
        let caps = FREE_MEM.captures(output)?;
        let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
        let (swap_total_bytes, swap_used_bytes) = FREE_SWAP
            .captures(output)
            .and_then(|swap| Some((swap[1].parse().ok()?, swap[2].parse().ok()?)))
            .unwrap_or((0, 0));

        Some(Self {
            total_bytes: number(1)?,
            used_bytes: number(2)?,
            free_bytes: number(3)?,
            available_bytes: number(4),
            swap_total_bytes,
            swap_used_bytes,
        })
    }

    fn parse_meminfo(output: &str) -> Option<Self> {
        let fields: HashMap<&str, u64> = MEMINFO
            .captures_iter(output)
            .filter_map(|caps| {
                let key = caps.get(1)?.as_str();
                let kib: u64 = caps.get(2)?.as_str().parse().ok()?;
                Some((key, kib * 1024))
            })
            .collect();

        let total_bytes = *fields.get("MemTotal")?;
        let free_bytes = fields.get("MemFree").copied().unwrap_or(0);
        let available_bytes = fields.get("MemAvailable").copied();
        let swap_total_bytes = fields.get("SwapTotal").copied().unwrap_or(0);
        let swap_free = fields.get("SwapFree").copied().unwrap_or(swap_total_bytes);

        Some(Self {
            total_bytes,
            used_bytes: total_bytes.saturating_sub(available_bytes.unwrap_or(free_bytes)),
            free_bytes,
            available_bytes,
            swap_total_bytes,
            swap_used_bytes: swap_total_bytes.saturating_sub(swap_free),
        })
    }
}

/// One mounted filesystem from `df -P -B1`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub filesystem: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub use_percent: u8,
    pub mount_point: String,
}

impl DiskUsage {
    /// Rows that do not match the POSIX `df -P` layout are skipped
    pub fn parse_all(output: &str) -> Vec<Self> {
        output
            .lines()
            .filter_map(|line| {
                let caps = DF_ROW.captures(line.trim())?;
                Some(Self {
                    filesystem: caps[1].to_string(),
                    total_bytes: caps[2].parse().ok()?,
                    used_bytes: caps[3].parse().ok()?,
                    available_bytes: caps[4].parse().ok()?,
                    use_percent: caps[5].parse().ok()?,
                    mount_point: caps[6].trim().to_string(),
                })
            })
            .collect()
    }
}

/// Host resources in one response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: Option<String>,
    pub memory: Option<MemoryInfo>,
    pub disks: Vec<DiskUsage>,
    pub accelerators: Option<AcceleratorSummary>,
}

pub async fn memory_info(host: &dyn ExecutionTarget) -> Option<MemoryInfo> {
    let result = host.run(MEMORY_COMMAND).await;
    let parsed = MemoryInfo::parse(&result.stdout);
    if parsed.is_none() {
        debug!(host = %host.identity(), error = result.error_text(), "Memory information unavailable");
    }
    parsed
}

pub async fn disk_usage(host: &dyn ExecutionTarget) -> Vec<DiskUsage> {
    DiskUsage::parse_all(&host.run(DISK_COMMAND).await.stdout)
}

pub async fn hostname(host: &dyn ExecutionTarget) -> Option<String> {
    let result = host.run("hostname").await;
    let name = result.stdout.trim();
    (result.success && !name.is_empty()).then(|| name.to_string())
}

/// Gather memory, disk and accelerator totals; every part degrades to empty
pub async fn system_info(host: &dyn ExecutionTarget, accelerators: &AcceleratorRegistry) -> SystemInfo {
    SystemInfo {
        hostname: hostname(host).await,
        memory: memory_info(host).await,
        disks: disk_usage(host).await,
        accelerators: accelerators.summary(host).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_core::ExecutionResult;
    use serve_dev::ScriptedTarget;

    #[test]
    fn test_parse_free_output() {
        let output = "              total        used        free      shared  buff/cache   available\n\
                      Mem:    67430559744 12884901888 41875931136    10485760 12669726720 53687091200\n\
                      Swap:    8589930496   1073741824  7516188672\n";
        let memory = MemoryInfo::parse(output).unwrap();

        assert_eq!(memory.total_bytes, 67_430_559_744);
        assert_eq!(memory.used_bytes, 12_884_901_888);
        assert_eq!(memory.available_bytes, Some(53_687_091_200));
        assert_eq!(memory.swap_used_bytes, 1_073_741_824);
    }

    #[test]
    fn test_parse_meminfo_fallback() {
        let output = "MemTotal:       16384000 kB\nMemFree:         2048000 kB\nMemAvailable:    8192000 kB\n\
                      SwapTotal:       1024000 kB\nSwapFree:         512000 kB\nHugePages_Total:       0\n";
        let memory = MemoryInfo::parse(output).unwrap();

        assert_eq!(memory.total_bytes, 16_384_000 * 1024);
        assert_eq!(memory.used_bytes, (16_384_000 - 8_192_000) * 1024);
        assert_eq!(memory.free_bytes, 2_048_000 * 1024);
        assert_eq!(memory.swap_used_bytes, 512_000 * 1024);
    }

    #[test]
    fn test_unrecognised_memory_output() {
        assert!(MemoryInfo::parse("").is_none());
        assert!(MemoryInfo::parse("free: command not found").is_none());
    }

    #[test]
    fn test_parse_df_output() {
        let output = "Filesystem         1-blocks         Used    Available Capacity Mounted on\n\
                      /dev/nvme0n1p2 1967317618688 524288000000 1343029618688      29% /\n\
                      //nas/models    1000000000000 1000 999999999000       1% /mnt/shared models\n\
                      garbage line\n";
        let disks = DiskUsage::parse_all(output);

        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].mount_point, "/");
        assert_eq!(disks[0].use_percent, 29);
        assert_eq!(disks[1].mount_point, "/mnt/shared models");
    }

    #[tokio::test]
    async fn test_system_info_degrades_to_empty() {
        let host = ScriptedTarget::new().otherwise(ExecutionResult::from_exit(127, "", "sh: not found"));
        let info = system_info(&host, &AcceleratorRegistry::default()).await;

        assert!(info.hostname.is_none());
        assert!(info.memory.is_none());
        assert!(info.disks.is_empty());
        assert!(info.accelerators.is_none());
    }
}
