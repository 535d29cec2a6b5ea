//! Host CPU sampling for the autoscaler.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait CpuSampler: Send + Sync {
    /// Host-wide CPU utilisation in percent since the previous sample.
    /// `None` when the host cannot be read.
    async fn sample(&self) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Aggregate `cpu` line of `/proc/stat`. Idle includes iowait.
pub fn parse_proc_stat(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: values.iter().sum(),
    })
}

pub fn utilisation(prev: CpuTimes, cur: CpuTimes) -> Option<f64> {
    let total = cur.total.checked_sub(prev.total)?;
    let idle = cur.idle.checked_sub(prev.idle)?;
    if total == 0 {
        return None;
    }
    Some(((total - idle.min(total)) as f64 / total as f64) * 100.0)
}

/// Reads `/proc/stat`. The first call primes itself with a short second
/// read.
pub struct ProcStatSampler {
    prev: Mutex<Option<CpuTimes>>,
    prime_delay: Duration,
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self {
            prev: Mutex::new(None),
            prime_delay: Duration::from_millis(250),
        }
    }

    async fn read() -> Option<CpuTimes> {
        let stat = tokio::fs::read_to_string("/proc/stat").await.ok()?;
        parse_proc_stat(&stat)
    }
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CpuSampler for ProcStatSampler {
    async fn sample(&self) -> Option<f64> {
        let prev = *self.prev.lock().unwrap_or_else(|p| p.into_inner());
        let prev = match prev {
            Some(p) => p,
            None => {
                let first = Self::read().await?;
                tokio::time::sleep(self.prime_delay).await;
                first
            }
        };
        let cur = Self::read().await?;
        *self.prev.lock().unwrap_or_else(|p| p.into_inner()) = Some(cur);
        utilisation(prev, cur)
    }
}

/// Replays a fixed series; the last value repeats once the series is
/// exhausted.
pub struct FixedCpuSampler {
    series: Mutex<VecDeque<f64>>,
    last: Mutex<Option<f64>>,
}

impl FixedCpuSampler {
    pub fn new(series: impl IntoIterator<Item = f64>) -> Self {
        Self {
            series: Mutex::new(series.into_iter().collect()),
            last: Mutex::new(None),
        }
    }

    pub fn push(&self, values: impl IntoIterator<Item = f64>) {
        self.series
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(values);
    }
}

#[async_trait]
impl CpuSampler for FixedCpuSampler {
    async fn sample(&self) -> Option<f64> {
        let next = self
            .series
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if next.is_some() {
            *last = next;
        }
        *last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aggregate_line() {
        let stat = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n";
        let t = parse_proc_stat(stat).unwrap();
        assert_eq!(t.idle, 800);
        assert_eq!(t.total, 1000);
        assert!(parse_proc_stat("intr 1 2").is_none());
    }

    #[test]
    fn utilisation_from_deltas() {
        let a = CpuTimes { idle: 800, total: 1000 };
        let b = CpuTimes { idle: 1000, total: 1400 };
        assert_eq!(utilisation(a, b), Some(50.0));
        assert_eq!(utilisation(b, b), None);
        assert_eq!(utilisation(b, a), None);
    }

    #[tokio::test]
    async fn fixed_sampler_repeats_last() {
        let s = FixedCpuSampler::new([20.0, 90.0]);
        assert_eq!(s.sample().await, Some(20.0));
        assert_eq!(s.sample().await, Some(90.0));
        assert_eq!(s.sample().await, Some(90.0));
        s.push([10.0]);
        assert_eq!(s.sample().await, Some(10.0));
        assert_eq!(FixedCpuSampler::new([]).sample().await, None);
    }
}
