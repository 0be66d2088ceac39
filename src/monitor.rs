use std::time::Duration;

use log::{debug, info};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::VmDefinition;
use crate::resources::UsageSampler;
use crate::supervisor::{self, RuntimeStatus};

/// Default sampling interval in seconds.
const DEFAULT_INTERVAL_SECS: u64 = 2;

/// Periodic, read-only sampling of one VM's runtime status.
///
/// Runs until cancelled, until the VM stops, or until `max_ticks` samples
/// have been taken.
pub struct Monitor {
    interval: Duration,
    max_ticks: Option<u64>,
    shutdown: CancellationToken,
}

impl Monitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_ticks: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = Some(max_ticks);
        self
    }

    /// Returns the token that stops a running loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sample `def` every interval, handing each status to `on_sample`.
    /// Returns the number of samples taken.
    pub async fn run<F>(&self, def: &VmDefinition, mut on_sample: F) -> u64
    where
        F: FnMut(u64, &RuntimeStatus),
    {
        let mut sampler = UsageSampler::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = 0;

        info!("Monitoring VM '{}' every {:?}", def.name, self.interval);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Monitor for VM '{}' cancelled", def.name);
                    break;
                }
                _ = ticker.tick() => {}
            }

            let status = supervisor::probe_with(&mut sampler, def);
            ticks += 1;
            on_sample(ticks, &status);

            if !status.is_running {
                info!("VM '{}' is no longer running, monitor finished", def.name);
                break;
            }
            if self.max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
        }
        ticks
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_INTERVAL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NewVm;
    use crate::supervisor::pidfile;
    use std::path::Path;

    fn vm(dir: &Path, pid: Option<u32>) -> VmDefinition {
        let mut def = VmDefinition::new(
            NewVm {
                name: "watched".into(),
                ram_mb: 1024,
                cpu_cores: 1,
                ssh_port: 2230,
                image_path: "/images/watched.qcow2".into(),
            },
            dir,
        );
        def.pid_file = dir.join("watched.pid").to_string_lossy().to_string();
        if let Some(pid) = pid {
            pidfile::write(&def.pid_file_path(), pid).unwrap();
        }
        def
    }

    #[tokio::test]
    async fn test_bounded_run() {
        let dir = tempfile::tempdir().unwrap();
        let def = vm(dir.path(), Some(std::process::id()));
        let monitor = Monitor::new(Duration::from_millis(20)).with_max_ticks(3);

        let mut samples = Vec::new();
        let ticks = monitor.run(&def, |tick, status| samples.push((tick, status.clone()))).await;

        assert_eq!(ticks, 3);
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|(_, s)| s.is_running));
        // The first sample has no CPU baseline yet
        assert!(samples[0].1.cpu_usage_percent.is_none());
        assert!(samples[2].1.cpu_usage_percent.is_some());
    }

    #[tokio::test]
    async fn test_stops_when_vm_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let def = vm(dir.path(), None);
        let monitor = Monitor::new(Duration::from_millis(10)).with_max_ticks(50);

        let ticks = monitor.run(&def, |_, status| assert!(!status.is_running)).await;
        assert_eq!(ticks, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_tick() {
        let dir = tempfile::tempdir().unwrap();
        let def = vm(dir.path(), Some(std::process::id()));
        let monitor = Monitor::default();
        monitor.shutdown_token().cancel();

        let ticks = monitor.run(&def, |_, _| panic!("no samples expected")).await;
        assert_eq!(ticks, 0);
    }

    #[tokio::test]
    async fn test_cancel_from_another_task() {
        let dir = tempfile::tempdir().unwrap();
        let def = vm(dir.path(), Some(std::process::id()));
        let monitor = Monitor::new(Duration::from_millis(10));
        let token = monitor.shutdown_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            token.cancel();
        });

        let ticks = monitor.run(&def, |_, _| {}).await;
        assert!(ticks >= 1);
    }
}
