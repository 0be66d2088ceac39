//! Process supervisor: starts, stops and probes the OS process behind a VM.
//!
//! The PID file is the only link between a VM definition and its process.
//! It can be stale, so every answer is reconciled with a live lookup.

pub mod pidfile;
pub mod process;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::{VmDefinition, VmState};
use crate::errors::{AvmError, Conflict, Result};
use crate::resources::{ProcessSnapshot, UsageSampler};
use crate::settings::HypervisorSettings;

use self::pidfile::PidFile;
use self::process::Termination;

/// Live view of a VM, computed on demand and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeStatus {
    #[serde(rename = "isRunning")]
    pub is_running: bool,
    pub pid: Option<u32>,
    #[serde(rename = "cpuUsagePercent")]
    pub cpu_usage_percent: Option<f32>,
    #[serde(rename = "memUsageMB")]
    pub mem_usage_mb: Option<f64>,
    pub uptime: Option<String>,
}

impl RuntimeStatus {
    fn stopped() -> Self {
        Self::default()
    }

    fn running(pid: u32, snapshot: Option<ProcessSnapshot>, def: &VmDefinition) -> Self {
        let run_time = snapshot
            .as_ref()
            .map(|s| s.run_time)
            .filter(|d| !d.is_zero())
            .or_else(|| pidfile::age(&def.pid_file_path()));

        let usage = snapshot.map(|s| s.usage).unwrap_or_default();
        RuntimeStatus {
            is_running: true,
            pid: Some(pid),
            cpu_usage_percent: usage.cpu_percent,
            mem_usage_mb: usage.mem_mb,
            uptime: run_time.map(|d| format_uptime(d.as_secs())),
        }
    }
}

pub struct ProcessSupervisor {
    hypervisor: HypervisorSettings,
}

impl ProcessSupervisor {
    pub fn new(hypervisor: HypervisorSettings) -> Self {
        Self { hypervisor }
    }

    /// Launch the VM's hypervisor process and record its PID.
    ///
    /// Returns once the process is spawned; boot progress is not awaited.
    pub fn start(&self, def: &VmDefinition, headless: bool) -> Result<u32> {
        if def.status == VmState::Running {
            return Err(AvmError::conflict(
                &def.name,
                Conflict::AlreadyRunning { pid: live_pid(def) },
            ));
        }
        if let Some(pid) = live_pid(def) {
            return Err(AvmError::conflict(
                &def.name,
                Conflict::AlreadyRunning { pid: Some(pid) },
            ));
        }

        info!(
            "Starting VM '{}' ({} MB, {} cores, SSH port {})",
            def.name, def.ram_mb, def.cpu_cores, def.ssh_port
        );

        let mut child = process::spawn(&self.hypervisor, def, headless).map_err(|e| {
            error!("Failed to launch {}: {}", self.hypervisor.program, e);
            AvmError::process(
                &def.name,
                format!("failed to launch {}: {}", self.hypervisor.program, e),
            )
        })?;
        let pid = child.id();

        let pid_path = def.pid_file_path();
        if let Err(e) = pidfile::write(&pid_path, pid) {
            error!("Failed to write PID file {:?}: {}", pid_path, e);
            let _ = child.kill();
            let _ = child.wait();
            return Err(AvmError::process(
                &def.name,
                format!("failed to write PID file {}: {}", pid_path.display(), e),
            ));
        }

        process::reap_in_background(child);
        info!("✔ VM '{}' started with PID: {}", def.name, pid);
        Ok(pid)
    }

    /// Signal the VM's process and clear its PID file.
    pub fn stop(&self, def: &VmDefinition) -> Result<()> {
        let pid_path = def.pid_file_path();
        let pid = match pidfile::read(&pid_path) {
            Ok(PidFile::Pid(pid)) => pid,
            Ok(PidFile::Missing) => {
                return Err(AvmError::conflict(&def.name, Conflict::NotRunning));
            }
            Ok(PidFile::Garbled(contents)) => {
                return Err(AvmError::process(
                    &def.name,
                    format!("PID file {} is unreadable: {:?}", pid_path.display(), contents),
                ));
            }
            Err(e) => {
                return Err(AvmError::process(
                    &def.name,
                    format!("PID file {} is unreadable: {}", pid_path.display(), e),
                ));
            }
        };

        match process::terminate(pid) {
            Ok(Termination::Signalled) => info!("Sent SIGTERM to VM '{}' (PID: {})", def.name, pid),
            Ok(Termination::AlreadyGone) => {
                warn!("Process {} for VM '{}' was already gone", pid, def.name)
            }
            Err(e) => {
                error!("Failed to signal PID {}: {}", pid, e);
                return Err(AvmError::process(
                    &def.name,
                    format!("failed to signal PID {}: {}", pid, e),
                ));
            }
        }

        if let Err(e) = pidfile::remove(&pid_path) {
            warn!("Could not remove PID file {:?}: {}", pid_path, e);
        }
        info!("✔ VM '{}' stopped", def.name);
        Ok(())
    }
}

/// The PID recorded for `def`, if it names a live process.
pub fn live_pid(def: &VmDefinition) -> Option<u32> {
    match pidfile::read(&def.pid_file_path()) {
        Ok(PidFile::Pid(pid)) if process::is_alive(pid) => Some(pid),
        Ok(PidFile::Pid(pid)) => {
            debug!("PID {} for VM '{}' is not alive", pid, def.name);
            None
        }
        Ok(_) => None,
        Err(e) => {
            debug!("Could not read PID file for VM '{}': {}", def.name, e);
            None
        }
    }
}

/// Runtime status of `def`, sampled once with a settled CPU reading.
pub async fn probe(def: &VmDefinition) -> RuntimeStatus {
    let Some(pid) = live_pid(def) else {
        return RuntimeStatus::stopped();
    };
    let mut sampler = UsageSampler::new();
    let snapshot = sampler.settled_snapshot(pid).await;
    status_from(pid, snapshot, def)
}

/// Runtime status of `def` using a long-lived sampler, as the monitor does.
pub fn probe_with(sampler: &mut UsageSampler, def: &VmDefinition) -> RuntimeStatus {
    let Some(pid) = live_pid(def) else {
        return RuntimeStatus::stopped();
    };
    let snapshot = sampler.snapshot(pid);
    status_from(pid, snapshot, def)
}

fn status_from(pid: u32, snapshot: Option<ProcessSnapshot>, def: &VmDefinition) -> RuntimeStatus {
    if snapshot.as_ref().is_some_and(|s| s.zombie) {
        debug!("PID {} for VM '{}' is a zombie", pid, def.name);
        return RuntimeStatus::stopped();
    }
    RuntimeStatus::running(pid, snapshot, def)
}

pub fn format_uptime(secs: u64) -> String {
    let (days, hours, mins, secs) = (
        secs / 86_400,
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
    );

    if days > 0 {
        format!("{}d {}h {}m", days, hours, mins)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
