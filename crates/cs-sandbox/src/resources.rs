//! Elastic per-container resource limits derived from host capacity.

use serde::{Deserialize, Serialize};

use cs_core::config::DockerConfig;

/// Reservation floor when the limit allows it.
const MIN_RESERVATION_MB: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub cpus: usize,
    pub mem_mb: u64,
}

impl HostCapacity {
    /// CPUs from the scheduler's view of parallelism, memory from
    /// `/proc/meminfo`; 2 CPUs / 4 GiB when either is unknown.
    pub fn detect() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let mem_mb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo_total_mb(&s))
            .unwrap_or(4096);
        Self { cpus, mem_mb }
    }
}

pub fn parse_meminfo_total_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory_mb: u64,
    pub reservation_mb: u64,
    pub swap_mb: u64,
    pub pids_limit: u32,
    pub cpu_shares: u32,
}

impl ResourceLimits {
    /// Fractions of the host, clamped per dimension. With `elastic` off the
    /// configured maxima are used as-is.
    pub fn compute(cfg: &DockerConfig, host: HostCapacity) -> Self {
        let (cpu_raw, mem_raw, res_raw) = if cfg.elastic {
            (
                host.cpus as f64 * cfg.cpu_fraction,
                host.mem_mb as f64 * cfg.mem_fraction,
                host.mem_mb as f64 * cfg.mem_reservation_fraction,
            )
        } else {
            (cfg.cpu_max, cfg.mem_max_mb as f64, cfg.mem_max_mb as f64 / 2.0)
        };

        let cpus = cpu_raw.clamp(cfg.cpu_min, cfg.cpu_max);
        let cpus = (cpus * 100.0).round() / 100.0;
        let memory_mb = (mem_raw as u64).clamp(cfg.mem_min_mb, cfg.mem_max_mb);
        let reservation_mb = (res_raw as u64)
            .max(MIN_RESERVATION_MB.min(memory_mb))
            .min(memory_mb);
        let swap_mb = ((memory_mb as f64 * cfg.memory_swap_ratio) as u64).max(memory_mb);

        Self {
            cpus,
            memory_mb,
            reservation_mb,
            swap_mb,
            pids_limit: cfg.pids_limit,
            cpu_shares: cfg.cpu_shares,
        }
    }

    pub fn to_flags(&self) -> Vec<String> {
        vec![
            "--cpus".into(),
            format!("{}", self.cpus),
            "--memory".into(),
            format!("{}m", self.memory_mb),
            "--memory-reservation".into(),
            format!("{}m", self.reservation_mb),
            "--memory-swap".into(),
            format!("{}m", self.swap_mb),
            "--cpu-shares".into(),
            self.cpu_shares.to_string(),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
        ]
    }
}
