use std::sync::Mutex;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use sysinfo::System;

/// Point-in-time host utilization reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(cpu_percent: f32, mem_percent: f32) -> Self {
        Self {
            cpu_percent,
            mem_percent,
            sampled_at: Utc::now(),
        }
    }

    /// Reading used before any successful sample exists
    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Source of host utilization readings. Advisory only: implementations never fail.
pub trait ResourceMonitor: Send + Sync + 'static {
    fn sample(&self) -> ResourceSnapshot;
}

struct SamplerState {
    system: System,
    last_good: Option<ResourceSnapshot>,
}

/// `sysinfo`-backed monitor. Blocks for the sampling interval, so async callers
/// should run it through `spawn_blocking`.
pub struct SystemMonitor {
    interval: Duration,
    state: Mutex<SamplerState>,
}

impl SystemMonitor {
    pub fn new(sample_interval_ms: u64) -> Self {
        // CPU usage is a delta between two refreshes; sysinfo needs a minimum gap
        let interval = Duration::from_millis(sample_interval_ms)
            .max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)
            .min(Duration::from_millis(950));
        Self {
            interval,
            state: Mutex::new(SamplerState {
                system: System::new(),
                last_good: None,
            }),
        }
    }

    fn fallback(last_good: Option<ResourceSnapshot>) -> ResourceSnapshot {
        last_good.unwrap_or_else(ResourceSnapshot::idle)
    }
}

impl ResourceMonitor for SystemMonitor {
    fn sample(&self) -> ResourceSnapshot {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        state.system.refresh_cpu_usage();
        std::thread::sleep(self.interval);
        state.system.refresh_cpu_usage();
        state.system.refresh_memory();

        let cpu = state.system.global_cpu_usage();
        let total = state.system.total_memory();
        let used = state.system.used_memory();

        if !cpu.is_finite() || total == 0 {
            warn!("Resource sampling returned unusable values (cpu={}, total_mem={}), using stale snapshot", cpu, total);
            return Self::fallback(state.last_good);
        }

        let mem = (used as f64 / total as f64 * 100.0) as f32;
        let snapshot = ResourceSnapshot::new(cpu.clamp(0.0, 100.0), mem.clamp(0.0, 100.0));
        debug!("Resource snapshot: cpu={:.1}% mem={:.1}%", snapshot.cpu_percent, snapshot.mem_percent);
        state.last_good = Some(snapshot);
        snapshot
    }
}

/// Monitor returning a fixed reading
#[derive(Debug, Clone, Copy)]
pub struct StaticMonitor {
    pub cpu_percent: f32,
    pub mem_percent: f32,
}

impl ResourceMonitor for StaticMonitor {
    fn sample(&self) -> ResourceSnapshot {
        ResourceSnapshot::new(self.cpu_percent, self.mem_percent)
    }
}
