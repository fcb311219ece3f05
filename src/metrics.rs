//! Coarse host metrics reported with every heartbeat.

use crate::platform::{self, CpuTimes};
use crate::protocol::HeartbeatPayload;
use std::sync::Mutex;
use std::time::Instant;

/// Static host identity plus the rolling CPU sampler.
pub struct HostMetrics {
    hostname: String,
    os_info: String,
    started: Instant,
    cpu: Mutex<CpuSampler>,
}

impl HostMetrics {
    pub fn new() -> HostMetrics {
        let mut cpu = CpuSampler::new();
        // Prime the rolling counters; the first sample has no delta and is
        // discarded here.
        let _ = cpu.sample(platform::cpu_times());

        HostMetrics {
            hostname: platform::hostname(),
            os_info: platform::os_description(),
            started: Instant::now(),
            cpu: Mutex::new(cpu),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn os_info(&self) -> &str {
        &self.os_info
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> HeartbeatPayload {
        let cpu = self
            .cpu
            .lock()
            .map(|mut sampler| sampler.sample(platform::cpu_times()))
            .unwrap_or(0.0);
        HeartbeatPayload {
            uptime: self.uptime_secs(),
            cpu,
            mem: platform::memory_percent().unwrap_or(0.0),
        }
    }
}

/// Computes whole-system CPU load from the delta between two counter
/// snapshots. Returns 0 until a delta exists.
struct CpuSampler {
    last: Option<CpuTimes>,
}

impl CpuSampler {
    fn new() -> CpuSampler {
        CpuSampler { last: None }
    }

    fn sample(&mut self, now: Option<CpuTimes>) -> f32 {
        let Some(now) = now else {
            return 0.0;
        };
        let previous = self.last.replace(now);
        let Some(previous) = previous else {
            return 0.0;
        };

        let total = now.total.saturating_sub(previous.total);
        let idle = now.idle.saturating_sub(previous.idle);
        if total == 0 {
            return 0.0;
        }
        (total.saturating_sub(idle) as f32 / total as f32) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_reports_zero() {
        let mut sampler = CpuSampler::new();
        let load = sampler.sample(Some(CpuTimes {
            idle: 50,
            total: 100,
        }));
        assert_eq!(load, 0.0);
    }

    #[test]
    fn load_comes_from_the_delta() {
        let mut sampler = CpuSampler::new();
        sampler.sample(Some(CpuTimes {
            idle: 50,
            total: 100,
        }));
        let load = sampler.sample(Some(CpuTimes {
            idle: 75,
            total: 200,
        }));
        // 100 new ticks, 25 of them idle
        assert!((load - 75.0).abs() < 0.01);
    }

    #[test]
    fn missing_counters_report_zero_not_garbage() {
        let mut sampler = CpuSampler::new();
        assert_eq!(sampler.sample(None), 0.0);
        sampler.sample(Some(CpuTimes {
            idle: 10,
            total: 20,
        }));
        assert_eq!(sampler.sample(None), 0.0);
    }

    #[test]
    fn uptime_starts_near_zero_and_identity_is_static() {
        let metrics = HostMetrics::new();
        assert!(metrics.uptime_secs() < 5);
        assert!(!metrics.hostname().is_empty());
        assert!(!metrics.os_info().is_empty());
    }
}
