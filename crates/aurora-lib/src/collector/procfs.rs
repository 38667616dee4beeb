//! Linux procfs reader
//!
//! Parses the handful of `/proc` files needed for a host and self-process
//! snapshot. The proc root is configurable so tests can point it at a fake
//! tree in a temporary directory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::SystemSource;

/// Jiffies per second; `sysconf(_SC_CLK_TCK)` is 100 on every mainstream Linux
const DEFAULT_CLOCK_TICKS: u64 = 100;

/// Cumulative CPU time counters from the aggregate `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    /// idle + iowait
    pub idle: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
}

/// Unprocessed counters from one read of the system
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReadings {
    pub cpu: CpuTimes,
    pub cores: usize,
    pub load_average: [f64; 3],
    pub memory_total: u64,
    pub memory_available: u64,
    pub disk: Option<DiskUsage>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub pid: u32,
    pub uptime_secs: f64,
    pub threads: u64,
    pub virtual_bytes: u64,
    pub resident_bytes: u64,
    pub peak_resident_bytes: u64,
    pub heap_bytes: u64,
}

/// `SystemSource` backed by procfs and `statvfs`
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    proc_root: PathBuf,
    disk_path: PathBuf,
    clock_ticks: u64,
}

impl ProcfsSource {
    pub fn new(proc_root: impl AsRef<Path>, disk_path: impl AsRef<Path>) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
            disk_path: disk_path.as_ref().to_path_buf(),
            clock_ticks: DEFAULT_CLOCK_TICKS,
        }
    }

    pub fn with_clock_ticks(mut self, ticks: u64) -> Self {
        self.clock_ticks = ticks.max(1);
        self
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }

    async fn read_file(&self, relative: &str) -> Result<String> {
        let path = self.proc_root.join(relative);
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Optional files degrade to defaults instead of failing the whole read
    async fn read_optional(&self, relative: &str) -> Option<String> {
        match self.read_file(relative).await {
            Ok(content) => Some(content),
            Err(e) => {
                debug!(file = relative, error = %e, "Optional proc file unavailable");
                None
            }
        }
    }
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new("/proc", "/")
    }
}

#[async_trait]
impl SystemSource for ProcfsSource {
    async fn read(&self) -> Result<RawReadings> {
        let stat = self.read_file("stat").await?;
        let (cpu, cores) = parse_stat(&stat)?;

        let meminfo = self.read_file("meminfo").await?;
        let (memory_total, memory_available) = parse_meminfo(&meminfo)?;

        let mut readings = RawReadings {
            cpu,
            cores,
            memory_total,
            memory_available,
            ..RawReadings::default()
        };

        if let Some(loadavg) = self.read_optional("loadavg").await {
            readings.load_average = parse_loadavg(&loadavg);
        }

        if let Some(netdev) = self.read_optional("net/dev").await {
            let (rx_bytes, tx_bytes, rx_errors, tx_errors) = parse_net_dev(&netdev);
            readings.rx_bytes = rx_bytes;
            readings.tx_bytes = tx_bytes;
            readings.rx_errors = rx_errors;
            readings.tx_errors = tx_errors;
        }

        if let Some(status) = self.read_optional("self/status").await {
            let status = parse_status(&status);
            readings.threads = status.threads;
            readings.virtual_bytes = status.vm_size;
            readings.resident_bytes = status.vm_rss;
            readings.peak_resident_bytes = status.vm_hwm;
            readings.heap_bytes = status.vm_data;
        }

        if let Some(self_stat) = self.read_optional("self/stat").await {
            if let Some((pid, start_ticks)) = parse_self_stat(&self_stat) {
                readings.pid = pid;
                if let Some(uptime) = self.read_optional("uptime").await {
                    let system_uptime = parse_uptime(&uptime);
                    let started_at = start_ticks as f64 / self.clock_ticks as f64;
                    readings.uptime_secs = (system_uptime - started_at).max(0.0);
                }
            }
        }

        readings.disk = disk_usage(&self.disk_path);

        Ok(readings)
    }
}

fn disk_usage(path: &Path) -> Option<DiskUsage> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            let total = (stat.blocks() as u64).saturating_mul(fragment);
            let free = (stat.blocks_free() as u64).saturating_mul(fragment);
            Some(DiskUsage {
                total,
                used: total.saturating_sub(free),
            })
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "statvfs failed");
            None
        }
    }
}

/// Aggregate CPU counters and the number of per-core lines
pub fn parse_stat(content: &str) -> Result<(CpuTimes, usize)> {
    let mut times = None;
    let mut cores = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("cpu") => {
                let values: Vec<u64> = parts.filter_map(|v| v.parse().ok()).collect();
                if values.len() < 4 {
                    anyhow::bail!("Malformed cpu line in /proc/stat: {line}");
                }
                // user nice system idle iowait irq softirq steal; guest time is already in user
                let idle = values[3].saturating_add(values.get(4).copied().unwrap_or(0));
                let total = values.iter().take(8).fold(0u64, |acc, v| acc.saturating_add(*v));
                times = Some(CpuTimes { idle, total });
            }
            Some(label) if label.starts_with("cpu") => cores += 1,
            _ => {}
        }
    }

    let times = times.context("No aggregate cpu line in /proc/stat")?;
    Ok((times, cores.max(1)))
}

/// `(MemTotal, MemAvailable)` in bytes
pub fn parse_meminfo(content: &str) -> Result<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        let bytes = kb.saturating_mul(1024);
        match key {
            "MemTotal:" => total = Some(bytes),
            "MemAvailable:" => available = Some(bytes),
            "MemFree:" => free = bytes,
            "Buffers:" => buffers = bytes,
            "Cached:" => cached = bytes,
            _ => {}
        }
    }

    let total = total.context("MemTotal missing from /proc/meminfo")?;
    // kernels before 3.14 lack MemAvailable
    let available = available
        .unwrap_or_else(|| free.saturating_add(buffers).saturating_add(cached))
        .min(total);
    Ok((total, available))
}

pub fn parse_loadavg(content: &str) -> [f64; 3] {
    let mut load = [0.0; 3];
    for (slot, value) in load.iter_mut().zip(content.split_whitespace()) {
        *slot = value.parse().unwrap_or(0.0);
    }
    load
}

/// Summed `(rx_bytes, tx_bytes, rx_errors, tx_errors)` over non-loopback interfaces
pub fn parse_net_dev(content: &str) -> (u64, u64, u64, u64) {
    let mut totals = (0, 0, 0, 0);

    for line in content.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let values: Vec<u64> = counters
            .split_whitespace()
            .map(|v| v.parse().unwrap_or(0))
            .collect();
        if values.len() < 11 {
            continue;
        }
        totals.0 = values[0].saturating_add(totals.0);
        totals.2 = values[2].saturating_add(totals.2);
        totals.1 = values[8].saturating_add(totals.1);
        totals.3 = values[10].saturating_add(totals.3);
    }

    totals
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProcessStatus {
    pub threads: u64,
    pub vm_size: u64,
    pub vm_rss: u64,
    pub vm_hwm: u64,
    pub vm_data: u64,
}

pub fn parse_status(content: &str) -> ProcessStatus {
    let mut status = ProcessStatus::default();

    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value: u64 = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        match key {
            "Threads" => status.threads = value,
            "VmSize" => status.vm_size = value.saturating_mul(1024),
            "VmRSS" => status.vm_rss = value.saturating_mul(1024),
            "VmHWM" => status.vm_hwm = value.saturating_mul(1024),
            "VmData" => status.vm_data = value.saturating_mul(1024),
            _ => {}
        }
    }

    status
}

/// `(pid, starttime in clock ticks)` from `/proc/self/stat`
pub fn parse_self_stat(content: &str) -> Option<(u32, u64)> {
    let pid = content.split_whitespace().next()?.parse().ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'
    let rest = &content[content.rfind(')')? + 1..];
    let start_ticks = rest.split_whitespace().nth(19)?.parse().ok()?;
    Some((pid, start_ticks))
}

pub fn parse_uptime(content: &str) -> f64 {
    content
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}
