//! Host resource usage (CPU, memory) for scaling and alerting.
//!
//! Readings are taken by [`run_sampler`] on a blocking thread and cached;
//! [`ResourceProbe::usage`] only returns the latest snapshot so the
//! request path never touches the OS.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Resource usage at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// Global CPU utilisation across all cores, 0-100.
    pub cpu_percent: f64,
    /// Used share of system memory, 0-100.
    pub memory_percent: f64,
    /// Resident set size of this process.
    pub process_resident_bytes: u64,
}

/// Source of resource usage readings.
pub trait ResourceProbe: Send + Sync {
    /// Latest cached reading. Must not block.
    fn usage(&self) -> ResourceUsage;

    /// Take a fresh reading. May block on OS calls.
    fn refresh(&self) {}
}

/// Samples the host through `sysinfo`.
///
/// CPU utilisation is a delta between two refreshes, so the first
/// snapshot reports 0% until the sampler has run once more.
pub struct SystemResourceProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    latest: RwLock<ResourceUsage>,
}

impl SystemResourceProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "cannot resolve own pid, resident bytes will read 0");
                None
            }
        };
        let probe = Self {
            system: Mutex::new(System::new()),
            pid,
            latest: RwLock::new(ResourceUsage::default()),
        };
        probe.refresh();
        probe
    }
}

impl Default for SystemResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemResourceProbe {
    fn usage(&self) -> ResourceUsage {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self) {
        let usage = {
            let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            sys.refresh_cpu_usage();
            sys.refresh_memory();

            let total = sys.total_memory();
            let memory_percent = if total > 0 {
                sys.used_memory() as f64 / total as f64 * 100.0
            } else {
                0.0
            };

            let process_resident_bytes = self
                .pid
                .and_then(|pid| {
                    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    sys.process(pid).map(|p| p.memory())
                })
                .unwrap_or(0);

            ResourceUsage {
                cpu_percent: f64::from(sys.global_cpu_usage()).clamp(0.0, 100.0),
                memory_percent: memory_percent.clamp(0.0, 100.0),
                process_resident_bytes,
            }
        };
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = usage;
    }
}

/// Fixed readings that can be changed at runtime.
#[derive(Debug, Default)]
pub struct StaticResourceProbe {
    usage: RwLock<ResourceUsage>,
}

impl StaticResourceProbe {
    pub fn new(usage: ResourceUsage) -> Self {
        Self {
            usage: RwLock::new(usage),
        }
    }

    pub fn set(&self, usage: ResourceUsage) {
        *self.usage.write().unwrap_or_else(PoisonError::into_inner) = usage;
    }
}

impl ResourceProbe for StaticResourceProbe {
    fn usage(&self) -> ResourceUsage {
        *self.usage.read().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Sampling loop ──────────────────────────────────────────────

/// Refresh `probe` every `interval` on the blocking pool until `shutdown` flips.
pub async fn run_sampler(
    probe: Arc<dyn ResourceProbe>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "resource sampler started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let probe = probe.clone();
                match tokio::task::spawn_blocking(move || {
                    probe.refresh();
                    probe.usage()
                })
                .await
                {
                    Ok(usage) => debug!(
                        cpu = usage.cpu_percent,
                        memory = usage.memory_percent,
                        resident = usage.process_resident_bytes,
                        "resources sampled"
                    ),
                    Err(e) => warn!(error = %e, "resource sample failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("resource sampler shutting down");
                break;
            }
        }
    }
}
