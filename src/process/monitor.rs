use crate::error::{Result, WardenError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Reports the resident memory of a process
pub trait UsageSampler: Send + Sync {
    fn sample(&self, pid: u32) -> Result<u64>;
}

/// Memory sampler backed by `sysinfo`
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler for SysinfoSampler {
    fn sample(&self, pid: u32) -> Result<u64> {
        let sys_pid = Pid::from_u32(pid);
        let mut system = self
            .system
            .lock()
            .map_err(|_| WardenError::MonitorError("sampler lock poisoned".to_string()))?;

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        system
            .process(sys_pid)
            .map(|process| process.memory())
            .ok_or_else(|| WardenError::MonitorError(format!("process {} not found", pid)))
    }
}

/// Periodic memory check of one live process.
///
/// The polling task stops on its own after reporting a breach and is aborted
/// when the monitor is dropped.
#[derive(Debug)]
pub struct UsageMonitor {
    task: JoinHandle<()>,
}

impl UsageMonitor {
    /// Start polling `pid` every `every`; `on_breach` receives the first
    /// sample above `threshold`.
    pub fn spawn<F>(
        pid: u32,
        threshold: u64,
        every: Duration,
        sampler: Arc<dyn UsageSampler>,
        on_breach: F,
    ) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let sampler = sampler.clone();
                let usage = match tokio::task::spawn_blocking(move || sampler.sample(pid)).await {
                    Ok(Ok(usage)) => usage,
                    Ok(Err(e)) => {
                        warn!("Skipping memory check of pid {}: {}", pid, e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Memory sampler task for pid {} failed: {}", pid, e);
                        continue;
                    }
                };

                debug!("pid {} uses {} bytes (limit {})", pid, usage, threshold);
                if usage > threshold {
                    on_breach(usage);
                    break;
                }
            }
        });

        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for UsageMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
