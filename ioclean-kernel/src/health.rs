use crate::registry::DeviceRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusHealth {
    pub status: String,
    pub uptime_seconds: u64,
    pub connected_devices: Vec<String>,
    pub configured_devices: usize,
    pub queue_depth: usize,
    pub pending_commands: usize,
    pub commands_sent: u64,
    pub commands_acked: u64,
    pub command_timeouts: u64,
    pub reconnects: u64,
    pub memory_usage_mb: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    acked: AtomicU64,
    timeouts: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now(), counters: Arc::new(Counters::default()) }
    }

    pub fn record_sent(&self) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// `ok` si tous les équipements configurés sont connectés, `degraded` sinon
    pub fn get_health(
        &self,
        registry: &DeviceRegistry,
        configured_devices: usize,
        queue_depth: usize,
        pending_commands: usize,
    ) -> BusHealth {
        let connected_devices = registry.device_ids();
        let status = if connected_devices.len() >= configured_devices { "ok" } else { "degraded" };

        BusHealth {
            status: status.to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connected_devices,
            configured_devices,
            queue_depth,
            pending_commands,
            commands_sent: self.counters.sent.load(Ordering::Relaxed),
            commands_acked: self.counters.acked.load(Ordering::Relaxed),
            command_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

fn get_memory_usage_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb / 1024;
            }
        }
    }
    0
}
