use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RAM_MB: u32 = 4096;
pub const DEFAULT_MAX_CPU: u32 = 4;

/// The persisted registry of VM definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(rename = "defaultVM", default)]
    pub default_vm: String,
    #[serde(default)]
    pub vms: BTreeMap<String, VmDefinition>,
    #[serde(rename = "logFile", default)]
    pub log_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[default]
    Stopped,
    Running,
    Suspended,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Stopped => write!(f, "stopped"),
            VmState::Running => write!(f, "running"),
            VmState::Suspended => write!(f, "suspended"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub name: String,
    #[serde(rename = "ram")]
    pub ram_mb: u32,
    #[serde(rename = "cpu")]
    pub cpu_cores: u32,
    #[serde(rename = "sshPort")]
    pub ssh_port: u16,
    #[serde(rename = "vncPort", default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(rename = "image")]
    pub image_path: String,
    #[serde(default)]
    pub status: VmState,
    #[serde(rename = "pidFile", default)]
    pub pid_file: String,
    #[serde(rename = "logFile", default)]
    pub log_file: String,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resources: ResourceLimits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(rename = "currentRAM", default)]
    pub current_ram: u32,
    #[serde(rename = "currentCPU", default)]
    pub current_cpu: u32,
    #[serde(rename = "maxRAM", default)]
    pub max_ram: u32,
    #[serde(rename = "maxCPU", default)]
    pub max_cpu: u32,
    #[serde(rename = "diskUsage", default)]
    pub disk_usage_bytes: u64,
}

/// Parameters of a create-VM intent.
#[derive(Debug, Clone)]
pub struct NewVm {
    pub name: String,
    pub ram_mb: u32,
    pub cpu_cores: u32,
    pub ssh_port: u16,
    pub image_path: String,
}

impl VmDefinition {
    /// Build a stopped definition with limits derived from the requested size.
    pub fn new(spec: NewVm, log_dir: &Path) -> Self {
        VmDefinition {
            log_file: log_dir
                .join(format!("{}.log", spec.name))
                .to_string_lossy()
                .to_string(),
            pid_file: default_pid_file(&spec.name).to_string_lossy().to_string(),
            resources: ResourceLimits {
                current_ram: spec.ram_mb,
                current_cpu: spec.cpu_cores,
                max_ram: spec.ram_mb.max(DEFAULT_MAX_RAM_MB),
                max_cpu: spec.cpu_cores.max(DEFAULT_MAX_CPU),
                disk_usage_bytes: 0,
            },
            name: spec.name,
            ram_mb: spec.ram_mb,
            cpu_cores: spec.cpu_cores,
            ssh_port: spec.ssh_port,
            vnc_port: None,
            image_path: spec.image_path,
            status: VmState::Stopped,
            created_at: Utc::now(),
        }
    }

    pub fn pid_file_path(&self) -> PathBuf {
        if self.pid_file.is_empty() {
            default_pid_file(&self.name)
        } else {
            PathBuf::from(&self.pid_file)
        }
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        (!self.log_file.is_empty()).then(|| PathBuf::from(&self.log_file))
    }
}

/// VM names end up in file names and firewall comment tags, so they are
/// limited to `[A-Za-z0-9._-]` and may not start with a dot.
pub fn check_vm_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("VM name must not be empty".to_string());
    }
    if name.starts_with('.') {
        return Err(format!("VM name '{}' must not start with '.'", name));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!(
            "VM name '{}' contains {:?}; use letters, digits, '.', '_' or '-'",
            name, c
        ));
    }
    Ok(())
}

pub fn default_pid_file(vm_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("avm-{}.pid", vm_name))
}

impl Registry {
    pub fn empty() -> Self {
        Registry {
            default_vm: String::new(),
            vms: BTreeMap::new(),
            log_file: String::new(),
        }
    }

    /// The document written by `config init`.
    pub fn initial(config_dir: &Path) -> Self {
        let log_dir = config_dir.join("logs");
        let default_vm = VmDefinition::new(
            NewVm {
                name: "default".to_string(),
                ram_mb: 2048,
                cpu_cores: 2,
                ssh_port: 2222,
                image_path: "~/alpine-vm.qcow2".to_string(),
            },
            &log_dir,
        );

        let mut vms = BTreeMap::new();
        vms.insert(default_vm.name.clone(), default_vm);

        Registry {
            default_vm: "default".to_string(),
            vms,
            log_file: log_dir.join("avm.log").to_string_lossy().to_string(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&VmDefinition> {
        self.vms.get(name)
    }

    /// A VM other than `except` that is marked running and forwards `port`.
    pub fn running_on_port(&self, port: u16, except: &str) -> Option<&VmDefinition> {
        self.vms
            .values()
            .find(|vm| vm.name != except && vm.status == VmState::Running && vm.ssh_port == port)
    }
}
