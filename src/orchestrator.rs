//! Lifecycle orchestrator: turns operator intents into registry transitions.
//!
//! Every intent loads the registry, delegates to the component that owns the
//! concern, and writes the registry back only once every step succeeded.
//! Read paths (status, list, diagnose) reconcile stale state in what they
//! report but never persist it.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{self, NewVm, Registry, VmDefinition, VmState};
use crate::errors::{AvmError, ConfigError, Conflict, Result};
use crate::monitor::Monitor;
use crate::network::{IsolationReport, NetworkIsolationManager, NetworkStatus};
use crate::recommend::{ProviderOverview, RecommendationEngine, SuggestionResult};
use crate::resources;
use crate::settings::Settings;
use crate::supervisor::{self, pidfile, process, ProcessSupervisor, RuntimeStatus};

/// Linear growth model used by `predict`, in MB per day.
const RAM_GROWTH_PER_DAY_MB: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatusReport {
    pub name: String,
    pub is_default: bool,
    /// Status as recorded in the registry.
    pub recorded_status: VmState,
    pub runtime: RuntimeStatus,
    /// Registry says running but no live process backs it.
    pub stale: bool,
    pub ram_mb: u32,
    pub cpu_cores: u32,
    pub ssh_port: u16,
    pub image: String,
}

pub enum StatusOutput {
    Json(String),
    Report(Vec<VmStatusReport>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmListEntry {
    pub name: String,
    pub is_default: bool,
    pub recorded_status: VmState,
    pub running: bool,
    pub ram_mb: u32,
    pub cpu_cores: u32,
    pub ssh_port: u16,
}

#[derive(Debug, Clone)]
pub struct ScaleOutcome {
    pub vm: VmDefinition,
    pub restart_required: bool,
}

#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    pub vm: VmDefinition,
    pub recommendations: SuggestionResult,
    /// Human-readable changes made by auto-apply.
    pub applied: Vec<String>,
    pub restart_required: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub vm: String,
    pub horizon_days: u32,
    pub current_ram_mb: u32,
    pub predicted_ram_mb: u32,
    pub current_cpu_cores: u32,
    pub predicted_cpu_cores: u32,
    pub upgrade_recommended: bool,
    pub recommendations: SuggestionResult,
}

#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub vm: String,
    pub context: String,
    pub stale: bool,
    pub runtime: RuntimeStatus,
    pub recommendations: SuggestionResult,
}

pub struct LifecycleOrchestrator {
    config_path: PathBuf,
    supervisor: ProcessSupervisor,
    network: NetworkIsolationManager,
    engine: RecommendationEngine,
    monitor: Monitor,
}

impl LifecycleOrchestrator {
    pub fn new(
        config_path: PathBuf,
        supervisor: ProcessSupervisor,
        network: NetworkIsolationManager,
        engine: RecommendationEngine,
    ) -> Self {
        Self {
            config_path,
            supervisor,
            network,
            engine,
            monitor: Monitor::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.config_path.clone(),
            ProcessSupervisor::new(settings.hypervisor.clone()),
            NetworkIsolationManager::default(),
            RecommendationEngine::new(settings.ai.clone()),
        )
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Token that ends a continuous `monitor_resources` run.
    pub fn monitor_shutdown(&self) -> CancellationToken {
        self.monitor.shutdown_token()
    }

    fn load(&self) -> Result<Registry> {
        Ok(config::load(&self.config_path)?)
    }

    fn save(&self, registry: &Registry) -> Result<()> {
        Ok(config::save(&self.config_path, registry)?)
    }

    /// Directory holding the registry and the per-VM log files.
    fn config_dir(&self) -> PathBuf {
        match self.config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// The explicit VM name, or the registry's default.
    pub fn resolve_target(&self, vm: Option<&str>) -> Result<String> {
        target(&self.load()?, vm)
    }

    /// Launch a VM. Returns its PID.
    pub fn start(&self, vm: Option<&str>, headless: bool) -> Result<u32> {
        let mut registry = self.load()?;
        let name = target(&registry, vm)?;
        let mut def = lookup(&registry, &name)?.clone();

        if def.status == VmState::Running {
            if let Some(pid) = supervisor::live_pid(&def) {
                return Err(AvmError::conflict(
                    &name,
                    Conflict::AlreadyRunning { pid: Some(pid) },
                ));
            }
            warn!("VM '{}' was marked running but has no live process", name);
            clear_stale_pid_file(&def);
            def.status = VmState::Stopped;
        }

        if let Some(owner) = registry.running_on_port(def.ssh_port, &name).cloned() {
            if supervisor::live_pid(&owner).is_some() {
                return Err(AvmError::conflict(
                    &name,
                    Conflict::SshPortInUse {
                        port: def.ssh_port,
                        owner: owner.name,
                    },
                ));
            }
            warn!(
                "VM '{}' was marked running on port {} but has no live process",
                owner.name, owner.ssh_port
            );
            if let Some(stale) = registry.vms.get_mut(&owner.name) {
                stale.status = VmState::Stopped;
            }
        }

        let pid = self.supervisor.start(&def, headless)?;

        def.status = VmState::Running;
        registry.vms.insert(name.clone(), def.clone());
        if let Err(e) = self.save(&registry) {
            warn!("Could not record start of VM '{}', terminating PID {}", name, pid);
            let _ = process::terminate(pid);
            clear_stale_pid_file(&def);
            return Err(e);
        }

        Ok(pid)
    }

    pub fn stop(&self, vm: Option<&str>) -> Result<StopOutcome> {
        let mut registry = self.load()?;
        let name = target(&registry, vm)?;
        let mut def = lookup(&registry, &name)?.clone();

        let outcome = match self.supervisor.stop(&def) {
            Ok(()) => StopOutcome::Stopped,
            Err(AvmError::StateConflict {
                conflict: Conflict::NotRunning,
                ..
            }) => {
                info!("VM '{}' is not running", name);
                StopOutcome::AlreadyStopped
            }
            Err(e) => return Err(e),
        };

        if def.status != VmState::Stopped {
            def.status = VmState::Stopped;
            registry.vms.insert(name, def);
            self.save(&registry)?;
        }
        Ok(outcome)
    }

    /// Live status of one VM, or of every VM when `vm` is `None`.
    pub async fn status(&self, vm: Option<&str>, as_json: bool) -> Result<StatusOutput> {
        let registry = self.load()?;
        let defs: Vec<&VmDefinition> = match vm {
            Some(name) => vec![lookup(&registry, name)?],
            None => registry.vms.values().collect(),
        };

        let mut reports = Vec::with_capacity(defs.len());
        for def in defs {
            let runtime = supervisor::probe(def).await;
            reports.push(VmStatusReport {
                name: def.name.clone(),
                is_default: registry.default_vm == def.name,
                recorded_status: def.status,
                stale: def.status == VmState::Running && !runtime.is_running,
                runtime,
                ram_mb: def.ram_mb,
                cpu_cores: def.cpu_cores,
                ssh_port: def.ssh_port,
                image: def.image_path.clone(),
            });
        }

        if as_json {
            let json = serde_json::to_string_pretty(&reports)
                .map_err(|e| AvmError::InvalidRequest(format!("cannot render status: {}", e)))?;
            Ok(StatusOutput::Json(json))
        } else {
            Ok(StatusOutput::Report(reports))
        }
    }

    pub fn create(&self, spec: NewVm) -> Result<VmDefinition> {
        check_new_vm(&spec)?;

        let mut registry = match self.load() {
            Ok(registry) => registry,
            Err(AvmError::Config(ConfigError::NotFound(_))) => {
                info!("No config at {:?}, starting a new one", self.config_path);
                Registry::empty()
            }
            Err(e) => return Err(e),
        };

        if registry.vms.contains_key(&spec.name) {
            return Err(AvmError::conflict(&spec.name, Conflict::AlreadyExists));
        }

        let def = VmDefinition::new(spec, &self.config_dir().join("logs"));
        if registry.default_vm.is_empty() {
            registry.default_vm = def.name.clone();
        }
        registry.vms.insert(def.name.clone(), def.clone());
        self.save(&registry)?;

        info!("✔ Created VM '{}'", def.name);
        Ok(def)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut registry = self.load()?;
        let def = lookup(&registry, name)?.clone();

        if supervisor::live_pid(&def).is_some() {
            return Err(AvmError::conflict(name, Conflict::DeleteWhileRunning));
        }
        if def.status == VmState::Running {
            warn!("Deleting VM '{}' which was marked running without a live process", name);
            clear_stale_pid_file(&def);
        }

        registry.vms.remove(name);
        if registry.default_vm == name {
            registry.default_vm.clear();
        }
        self.save(&registry)?;

        info!("✔ Deleted VM '{}'", name);
        Ok(())
    }

    pub fn switch_default(&self, name: &str) -> Result<()> {
        let mut registry = self.load()?;
        lookup(&registry, name)?;

        registry.default_vm = name.to_string();
        self.save(&registry)?;
        info!("✔ Default VM is now '{}'", name);
        Ok(())
    }

    pub fn scale_resources(
        &self,
        name: &str,
        ram_mb: Option<u32>,
        cpu_cores: Option<u32>,
    ) -> Result<ScaleOutcome> {
        let mut registry = self.load()?;
        let def = lookup(&registry, name)?;

        let updated = resources::scale(def, ram_mb, cpu_cores)?;
        let restart_required = supervisor::live_pid(&updated).is_some();

        registry.vms.insert(name.to_string(), updated.clone());
        self.save(&registry)?;

        Ok(ScaleOutcome {
            vm: updated,
            restart_required,
        })
    }

    /// Sample a running VM once, or continuously until the VM stops or the
    /// monitor is cancelled. Returns the number of samples taken.
    pub async fn monitor_resources<F>(
        &self,
        vm: Option<&str>,
        continuous: bool,
        mut on_sample: F,
    ) -> Result<u64>
    where
        F: FnMut(&VmDefinition, u64, &RuntimeStatus),
    {
        let registry = self.load()?;
        let name = target(&registry, vm)?;
        let def = lookup(&registry, &name)?;

        if supervisor::live_pid(def).is_none() {
            return Err(AvmError::conflict(&name, Conflict::NotRunning));
        }

        if !continuous {
            let status = supervisor::probe(def).await;
            on_sample(def, 1, &status);
            return Ok(1);
        }

        Ok(self
            .monitor
            .run(def, |tick, status| on_sample(def, tick, status))
            .await)
    }

    pub async fn isolate_network(
        &self,
        name: &str,
        allow_list: &[String],
        vpn: bool,
    ) -> Result<IsolationReport> {
        let registry = self.load()?;
        let def = lookup(&registry, name)?;
        self.network.isolate(def, allow_list, vpn).await
    }

    pub async fn network_status(&self, name: &str) -> Result<NetworkStatus> {
        let registry = self.load()?;
        let def = lookup(&registry, name)?;
        self.network.status(def).await
    }

    /// Ask for optimisation advice and, with `auto_apply`, act on the
    /// recognised scaling hints.
    pub async fn optimize(&self, name: &str, auto_apply: bool) -> Result<OptimizeOutcome> {
        let mut registry = self.load()?;
        let def = lookup(&registry, name)?.clone();
        let runtime = supervisor::probe(&def).await;

        let mut query = format!(
            "Optimize VM '{}': {} MB RAM, {} CPU cores, {}",
            def.name,
            def.ram_mb,
            def.cpu_cores,
            if runtime.is_running { "running" } else { "stopped" }
        );
        if let (Some(mem), Some(cpu)) = (runtime.mem_usage_mb, runtime.cpu_usage_percent) {
            query.push_str(&format!(", using {:.0} MB and {:.1}% CPU", mem, cpu));
        }

        let mut recommendations = self.engine.get_suggestions(&query).await?;
        let mut applied = Vec::new();
        let mut vm = def.clone();

        if auto_apply {
            let (new_ram, new_cpu) = auto_apply_plan(&def, &recommendations.suggestions);
            if new_ram.is_some() || new_cpu.is_some() {
                match resources::scale(&def, new_ram, new_cpu) {
                    Ok(updated) => {
                        if let Some(ram) = new_ram {
                            applied.push(format!("RAM {} -> {} MB", def.ram_mb, ram));
                        }
                        if let Some(cpu) = new_cpu {
                            applied.push(format!("CPU {} -> {} cores", def.cpu_cores, cpu));
                        }
                        registry.vms.insert(name.to_string(), updated.clone());
                        self.save(&registry)?;
                        vm = updated;
                    }
                    Err(e) => {
                        warn!("Auto-apply skipped for VM '{}': {}", name, e);
                        recommendations
                            .warnings
                            .push(format!("Auto-apply skipped: {}", e));
                    }
                }
            }
        }

        Ok(OptimizeOutcome {
            restart_required: !applied.is_empty() && runtime.is_running,
            vm,
            recommendations,
            applied,
        })
    }

    pub async fn predict(&self, name: &str, horizon_days: u32) -> Result<Prediction> {
        if horizon_days == 0 {
            return Err(AvmError::InvalidRequest(
                "prediction horizon must be at least one day".to_string(),
            ));
        }

        let registry = self.load()?;
        let def = lookup(&registry, name)?;

        let predicted_ram_mb = def
            .ram_mb
            .saturating_add(horizon_days.saturating_mul(RAM_GROWTH_PER_DAY_MB));
        let upgrade_recommended = u64::from(predicted_ram_mb) > 2 * u64::from(def.ram_mb);

        let query = format!(
            "Predict resource needs for VM '{}' over the next {} days: currently {} MB RAM and {} CPU cores, projected {} MB RAM",
            def.name, horizon_days, def.ram_mb, def.cpu_cores, predicted_ram_mb
        );
        let mut recommendations = self.engine.get_suggestions(&query).await?;
        if upgrade_recommended {
            recommendations.suggestions.push(format!(
                "Projected RAM of {} MB is more than double the current {} MB; plan a RAM upgrade",
                predicted_ram_mb, def.ram_mb
            ));
        }

        Ok(Prediction {
            vm: def.name.clone(),
            horizon_days,
            current_ram_mb: def.ram_mb,
            predicted_ram_mb,
            current_cpu_cores: def.cpu_cores,
            predicted_cpu_cores: def.cpu_cores,
            upgrade_recommended,
            recommendations,
        })
    }

    pub async fn diagnose(&self, name: &str) -> Result<Diagnosis> {
        let registry = self.load()?;
        let def = lookup(&registry, name)?;
        let runtime = supervisor::probe(def).await;
        let stale = def.status == VmState::Running && !runtime.is_running;

        let mut context = format!(
            "Diagnose VM '{}': recorded status {}, process {}, {} MB RAM, {} CPU cores",
            def.name,
            def.status,
            if runtime.is_running { "running" } else { "not running" },
            def.ram_mb,
            def.cpu_cores
        );
        if let Some(pid) = runtime.pid {
            context.push_str(&format!(", PID {}", pid));
        }
        if let Some(mem) = runtime.mem_usage_mb {
            context.push_str(&format!(", resident memory {:.1} MB", mem));
        }
        if stale {
            context.push_str("; registry says running but no live process was found");
        }

        let mut recommendations = self.engine.get_suggestions(&context).await?;
        if stale {
            recommendations.warnings.push(format!(
                "VM '{}' is recorded as running but its process is gone; run `avm stop {}` to reconcile",
                def.name, def.name
            ));
        }

        Ok(Diagnosis {
            vm: def.name.clone(),
            context,
            stale,
            runtime,
            recommendations,
        })
    }

    pub async fn get_suggestions(&self, query: &str) -> Result<SuggestionResult> {
        self.engine.get_suggestions(query).await
    }

    /// Free-form management request, framed as an instruction for the assistant.
    pub async fn ai_assist(&self, request: &str) -> Result<SuggestionResult> {
        if request.trim().is_empty() {
            return Err(AvmError::InvalidRequest("empty request".to_string()));
        }
        let query = format!(
            "Interpret and execute this VM management request: {}",
            request.trim()
        );
        self.engine.get_suggestions(&query).await
    }

    pub fn provider_overview(&self) -> Vec<ProviderOverview> {
        self.engine.provider_overview()
    }

    /// Write the starter registry. Never overwrites an existing file.
    pub fn init_config(&self) -> Result<Registry> {
        if self.config_path.exists() {
            return Err(ConfigError::AlreadyExists(self.config_path.clone()).into());
        }

        let registry = Registry::initial(&self.config_dir());
        self.save(&registry)?;

        info!("✔ Initialized config at {:?}", self.config_path);
        Ok(registry)
    }

    /// Load and validate the registry. Returns the number of VMs.
    pub fn validate_config(&self) -> Result<usize> {
        Ok(self.load()?.vms.len())
    }

    pub fn list_vms(&self) -> Result<Vec<VmListEntry>> {
        let registry = self.load()?;
        Ok(registry
            .vms
            .values()
            .map(|def| VmListEntry {
                name: def.name.clone(),
                is_default: registry.default_vm == def.name,
                recorded_status: def.status,
                running: supervisor::live_pid(def).is_some(),
                ram_mb: def.ram_mb,
                cpu_cores: def.cpu_cores,
                ssh_port: def.ssh_port,
            })
            .collect())
    }

    /// Arguments for an interactive SSH session into a running VM.
    pub fn ssh_command(&self, vm: Option<&str>) -> Result<Vec<String>> {
        let registry = self.load()?;
        let name = target(&registry, vm)?;
        let def = lookup(&registry, &name)?;

        if supervisor::live_pid(def).is_none() {
            return Err(AvmError::conflict(&name, Conflict::NotRunning));
        }

        Ok(vec![
            "ssh".to_string(),
            "-p".to_string(),
            def.ssh_port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "root@localhost".to_string(),
        ])
    }
}

fn target(registry: &Registry, vm: Option<&str>) -> Result<String> {
    match vm {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ if !registry.default_vm.is_empty() => Ok(registry.default_vm.clone()),
        _ => Err(AvmError::InvalidRequest(
            "no VM name given and no defaultVM configured".to_string(),
        )),
    }
}

fn lookup<'a>(registry: &'a Registry, name: &str) -> Result<&'a VmDefinition> {
    registry.get(name).ok_or_else(|| AvmError::not_found(name))
}

fn clear_stale_pid_file(def: &VmDefinition) {
    if let Err(e) = pidfile::remove(&def.pid_file_path()) {
        warn!("Could not remove PID file for VM '{}': {}", def.name, e);
    }
}

fn check_new_vm(spec: &NewVm) -> Result<()> {
    let invalid = |msg: &str| Err(AvmError::InvalidRequest(msg.to_string()));

    config::check_vm_name(&spec.name).map_err(AvmError::InvalidRequest)?;
    if spec.ram_mb == 0 {
        return invalid("RAM must be positive");
    }
    if spec.cpu_cores == 0 {
        return invalid("CPU cores must be positive");
    }
    if spec.ssh_port == 0 {
        return invalid("SSH port must be non-zero");
    }
    if spec.image_path.trim().is_empty() {
        return invalid("image path must not be empty");
    }
    Ok(())
}

/// Scaling hints recognised in assistant suggestions. Placeholder matching:
/// only the sizes the offline responder recommends are acted on.
fn auto_apply_plan(def: &VmDefinition, suggestions: &[String]) -> (Option<u32>, Option<u32>) {
    let text = suggestions.join("\n").to_lowercase();
    let ram = (text.contains("increase ram") && def.ram_mb == 2048).then_some(4096);
    let cpu = (text.contains("add cpu core") && def.cpu_cores == 2).then_some(4);
    (ram, cpu)
}
