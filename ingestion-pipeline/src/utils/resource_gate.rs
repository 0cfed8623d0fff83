use std::{sync::Arc, time::Duration};

use common::utils::config::ResourceLimits;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub memory_used_percent: f32,
    pub available_memory_mb: u64,
    pub cpu_percent: f32,
}

/// Source of memory and CPU readings. `None` means the platform offers no reading.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Option<ResourceSnapshot>;
}

/// Reads `/proc/meminfo` and `/proc/loadavg`.
pub struct ProcfsProbe;

impl ProcfsProbe {
    fn meminfo_kb(raw: &str, key: &str) -> Option<u64> {
        raw.lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse().ok())
    }
}

impl ResourceProbe for ProcfsProbe {
    fn sample(&self) -> Option<ResourceSnapshot> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let total_kb = Self::meminfo_kb(&meminfo, "MemTotal:")?;
        let available_kb = Self::meminfo_kb(&meminfo, "MemAvailable:")?;
        if total_kb == 0 {
            return None;
        }
        let used_kb = total_kb.saturating_sub(available_kb);

        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let load_1m: f32 = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|raw| raw.split_whitespace().next()?.parse().ok())
            .unwrap_or(0.0);

        Some(ResourceSnapshot {
            memory_used_percent: used_kb as f32 / total_kb as f32 * 100.0,
            available_memory_mb: available_kb / 1024,
            cpu_percent: load_1m / cpus as f32 * 100.0,
        })
    }
}

/// Advisory batch sizing for the embedding stage.
#[derive(Clone)]
pub struct ResourceGate {
    limits: ResourceLimits,
    probe: Arc<dyn ResourceProbe>,
}

impl ResourceGate {
    pub fn new(limits: ResourceLimits, probe: Arc<dyn ResourceProbe>) -> Self {
        Self { limits, probe }
    }

    pub fn system(limits: ResourceLimits) -> Self {
        Self::new(limits, Arc::new(ProcfsProbe))
    }

    /// `max_batch_size` wins when the limits are inverted.
    fn clamp(&self, size: usize) -> usize {
        size.max(self.limits.min_batch_size).min(self.limits.max_batch_size)
    }

    /// Batch size for `base` under the pressure described by `snapshot`.
    pub fn batch_size_for(&self, base: usize, snapshot: &ResourceSnapshot) -> usize {
        let mut size = base;
        if snapshot.memory_used_percent >= self.limits.memory_critical_percent {
            size /= 4;
        } else if snapshot.memory_used_percent >= self.limits.memory_warning_percent {
            size /= 2;
        }
        if snapshot.cpu_percent >= self.limits.cpu_high_percent {
            size /= 2;
        }
        self.clamp(size)
    }

    /// Recommends a batch size. When less than `min_memory_mb` is available it polls
    /// until memory frees up or the wait budget runs out, then settles for the minimum.
    pub async fn recommend_batch_size(&self, base: usize) -> usize {
        if !self.limits.enable_adaptive_batching {
            return self.clamp(base);
        }

        let deadline = Instant::now() + Duration::from_millis(self.limits.wait_budget_ms);
        let poll = Duration::from_millis(self.limits.poll_interval_ms.max(1));

        loop {
            let Some(snapshot) = self.probe.sample() else {
                return self.clamp(base);
            };

            if snapshot.available_memory_mb >= self.limits.min_memory_mb {
                let size = self.batch_size_for(base, &snapshot);
                if size != base {
                    debug!(
                        base,
                        recommended = size,
                        memory_percent = snapshot.memory_used_percent,
                        cpu_percent = snapshot.cpu_percent,
                        "adjusted embedding batch size"
                    );
                }
                return size;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    available_mb = snapshot.available_memory_mb,
                    required_mb = self.limits.min_memory_mb,
                    "memory still low after wait budget; using minimum batch size"
                );
                return self.limits.min_batch_size;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe(Option<ResourceSnapshot>, AtomicUsize);

    impl ResourceProbe for FixedProbe {
        fn sample(&self) -> Option<ResourceSnapshot> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0
        }
    }

    fn snapshot(memory: f32, available_mb: u64, cpu: f32) -> ResourceSnapshot {
        ResourceSnapshot {
            memory_used_percent: memory,
            available_memory_mb: available_mb,
            cpu_percent: cpu,
        }
    }

    fn gate(sample: Option<ResourceSnapshot>) -> (ResourceGate, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe(sample, AtomicUsize::new(0)));
        let limits = ResourceLimits {
            min_batch_size: 2,
            max_batch_size: 64,
            wait_budget_ms: 40,
            poll_interval_ms: 10,
            ..ResourceLimits::default()
        };
        (ResourceGate::new(limits, probe.clone()), probe)
    }

    #[test]
    fn pressure_shrinks_batches_within_bounds() {
        let (gate, _) = gate(None);
        assert_eq!(gate.batch_size_for(32, &snapshot(50.0, 4096, 10.0)), 32);
        assert_eq!(gate.batch_size_for(32, &snapshot(85.0, 4096, 10.0)), 16);
        assert_eq!(gate.batch_size_for(32, &snapshot(95.0, 4096, 10.0)), 8);
        assert_eq!(gate.batch_size_for(32, &snapshot(95.0, 4096, 99.0)), 4);
        assert_eq!(gate.batch_size_for(4, &snapshot(95.0, 4096, 99.0)), 2);
        assert_eq!(gate.batch_size_for(500, &snapshot(10.0, 4096, 1.0)), 64);
    }

    #[tokio::test]
    async fn low_memory_waits_out_the_budget_then_returns_minimum() {
        let (gate, probe) = gate(Some(snapshot(99.0, 16, 10.0)));
        let started = std::time::Instant::now();
        assert_eq!(gate.recommend_batch_size(32).await, 2);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(probe.1.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn inverted_limits_cap_at_the_maximum() {
        let limits = ResourceLimits {
            min_batch_size: 64,
            max_batch_size: 8,
            ..ResourceLimits::default()
        };
        let gate = ResourceGate::new(limits, Arc::new(FixedProbe(None, AtomicUsize::new(0))));
        assert_eq!(gate.batch_size_for(32, &snapshot(50.0, 4096, 10.0)), 8);
        assert_eq!(gate.batch_size_for(2, &snapshot(95.0, 4096, 99.0)), 8);
    }

    #[tokio::test]
    async fn missing_readings_fall_back_to_base() {
        let (gate, _) = gate(None);
        assert_eq!(gate.recommend_batch_size(32).await, 32);
    }
}
