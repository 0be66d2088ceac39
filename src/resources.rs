//! Resource controller: bounded RAM/CPU changes and live process usage.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

use crate::config::VmDefinition;
use crate::errors::{AvmError, Resource, Result};

/// Apply a RAM and/or CPU change to a copy of `def`.
///
/// Either every requested change applies or none does. The running VM is
/// not touched; a restart is needed before the guest sees the new size.
pub fn scale(def: &VmDefinition, new_ram: Option<u32>, new_cpu: Option<u32>) -> Result<VmDefinition> {
    if new_ram.is_none() && new_cpu.is_none() {
        return Err(AvmError::NoChangeRequested {
            vm: def.name.clone(),
        });
    }

    let limits = &def.resources;
    if let Some(ram) = new_ram {
        check_bound(def, Resource::Ram, ram, limits.max_ram)?;
    }
    if let Some(cpu) = new_cpu {
        check_bound(def, Resource::Cpu, cpu, limits.max_cpu)?;
    }

    let mut updated = def.clone();
    if let Some(ram) = new_ram {
        info!("Scaling VM '{}' RAM {} -> {} MB", def.name, def.ram_mb, ram);
        updated.ram_mb = ram;
        updated.resources.current_ram = ram;
    }
    if let Some(cpu) = new_cpu {
        info!("Scaling VM '{}' CPU {} -> {} cores", def.name, def.cpu_cores, cpu);
        updated.cpu_cores = cpu;
        updated.resources.current_cpu = cpu;
    }
    Ok(updated)
}

fn check_bound(def: &VmDefinition, resource: Resource, requested: u32, max: u32) -> Result<()> {
    if requested == 0 {
        return Err(AvmError::InvalidRequest(format!(
            "VM '{}': {} must be positive",
            def.name, resource
        )));
    }
    if requested > max {
        return Err(AvmError::ResourceLimit {
            vm: def.name.clone(),
            resource,
            requested,
            max,
        });
    }
    Ok(())
}

/// Usage figures for one process. `None` means the figure could not be
/// measured, which is different from zero usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub mem_mb: Option<f64>,
    pub cpu_percent: Option<f32>,
}

/// Process-table entry as seen by the sampler.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub usage: ProcessUsage,
    pub run_time: Duration,
    pub zombie: bool,
}

/// Samples per-process usage from the OS process table.
///
/// CPU percentages are computed between two refreshes, so a sampler that is
/// kept around (as the monitor loop does) reports deltas between ticks.
pub struct UsageSampler {
    system: System,
    // PIDs refreshed at least once; CPU is unknown before the second refresh
    seen: HashSet<Pid>,
}

impl UsageSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            seen: HashSet::new(),
        }
    }

    fn refresh(&mut self, pid: Pid) -> bool {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        !self.seen.insert(pid)
    }

    /// Refresh and read one process. `None` if it is not in the table.
    pub fn snapshot(&mut self, pid: u32) -> Option<ProcessSnapshot> {
        let pid = Pid::from_u32(pid);
        let has_baseline = self.refresh(pid);
        let Some(process) = self.system.process(pid) else {
            debug!("PID {} not found in process table", pid);
            return None;
        };

        Some(ProcessSnapshot {
            usage: ProcessUsage {
                mem_mb: Some(process.memory() as f64 / (1024.0 * 1024.0)),
                cpu_percent: has_baseline.then(|| process.cpu_usage()),
            },
            run_time: Duration::from_secs(process.run_time()),
            zombie: process.status() == ProcessStatus::Zombie,
        })
    }

    /// One-shot snapshot with a meaningful CPU figure: refreshes twice,
    /// `MINIMUM_CPU_UPDATE_INTERVAL` apart.
    pub async fn settled_snapshot(&mut self, pid: u32) -> Option<ProcessSnapshot> {
        self.refresh(Pid::from_u32(pid));
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        self.snapshot(pid)
    }
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NewVm;
    use std::path::Path;

    fn vm(ram: u32, cpu: u32) -> VmDefinition {
        VmDefinition::new(
            NewVm {
                name: "dev".into(),
                ram_mb: ram,
                cpu_cores: cpu,
                ssh_port: 2222,
                image_path: "alpine.qcow2".into(),
            },
            Path::new("/tmp"),
        )
    }

    #[test]
    fn test_scale_requires_a_change() {
        let err = scale(&vm(2048, 2), None, None).unwrap_err();
        assert!(matches!(err, AvmError::NoChangeRequested { .. }));
    }

    #[test]
    fn test_scale_updates_both_views() {
        let updated = scale(&vm(2048, 2), Some(4096), Some(3)).unwrap();
        assert_eq!(updated.ram_mb, 4096);
        assert_eq!(updated.resources.current_ram, 4096);
        assert_eq!(updated.cpu_cores, 3);
        assert_eq!(updated.resources.current_cpu, 3);
    }

    #[test]
    fn test_scale_is_all_or_nothing() {
        let def = vm(2048, 2);
        // RAM is within bounds but CPU is not, so nothing may change
        let err = scale(&def, Some(3072), Some(16)).unwrap_err();
        assert!(matches!(
            err,
            AvmError::ResourceLimit {
                resource: Resource::Cpu,
                requested: 16,
                max: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_scale_rejects_not_clamps() {
        let err = scale(&vm(2048, 2), Some(4097), None).unwrap_err();
        assert!(matches!(
            err,
            AvmError::ResourceLimit {
                resource: Resource::Ram,
                max: 4096,
                ..
            }
        ));
    }

    #[test]
    fn test_scale_rejects_zero() {
        let err = scale(&vm(2048, 2), None, Some(0)).unwrap_err();
        assert!(matches!(err, AvmError::InvalidRequest(_)));
    }

    #[test]
    fn test_usage_of_own_process() {
        let mut sampler = UsageSampler::new();
        let first = sampler.snapshot(std::process::id()).unwrap();
        assert!(first.usage.mem_mb.unwrap() > 0.0);
        assert!(!first.zombie);
        // No baseline yet, so CPU is unknown rather than 0%
        assert!(first.usage.cpu_percent.is_none());

        let second = sampler.snapshot(std::process::id()).unwrap();
        assert!(second.usage.cpu_percent.is_some());
    }

    #[tokio::test]
    async fn test_settled_snapshot_has_cpu() {
        let mut sampler = UsageSampler::new();
        let snapshot = sampler.settled_snapshot(std::process::id()).await.unwrap();
        assert!(snapshot.usage.cpu_percent.is_some());
        assert!(snapshot.usage.mem_mb.is_some());
    }

    #[test]
    fn test_missing_process_has_no_snapshot() {
        let mut sampler = UsageSampler::new();
        assert!(sampler.snapshot(i32::MAX as u32 - 7).is_none());
    }
}
