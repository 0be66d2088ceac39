use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use log::{debug, info};
use tempfile::NamedTempFile;

use crate::config::models::{check_vm_name, Registry, VmState};
use crate::errors::ConfigError;

/// Read, parse and validate the registry at `path`.
///
/// A document that fails validation is never returned.
pub fn load(path: &Path) -> Result<Registry, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    let registry: Registry = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    validate(&registry)?;
    debug!("Loaded {} VM definitions from {:?}", registry.vms.len(), path);
    Ok(registry)
}

/// Rewrite the whole registry at `path`.
///
/// The document goes to a temporary file in the same directory which is then
/// renamed over the destination, so readers see the old or the new file.
pub fn save(path: &Path, registry: &Registry) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    let data = serde_json::to_vec_pretty(registry)
        .map_err(|e| io_err(std::io::Error::new(ErrorKind::InvalidData, e)))?;

    let mut temp_file = NamedTempFile::new_in(dir).map_err(io_err)?;
    temp_file.write_all(&data).map_err(io_err)?;
    temp_file.write_all(b"\n").map_err(io_err)?;
    temp_file.as_file().sync_all().map_err(io_err)?;
    temp_file.persist(path).map_err(|e| io_err(e.error))?;

    info!("Saved config to {:?}", path);
    Ok(())
}

/// Check the registry invariants.
pub fn validate(registry: &Registry) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::Validation(msg));

    if !registry.default_vm.is_empty() && !registry.vms.contains_key(&registry.default_vm) {
        return invalid(format!(
            "defaultVM '{}' does not name a configured VM",
            registry.default_vm
        ));
    }

    let mut running_ports: HashMap<u16, &str> = HashMap::new();

    for (key, vm) in &registry.vms {
        if vm.name.is_empty() {
            return invalid(format!("VM '{}' is missing a name", key));
        }
        check_vm_name(key).map_err(ConfigError::Validation)?;
        if &vm.name != key {
            return invalid(format!("VM key '{}' does not match its name '{}'", key, vm.name));
        }
        if vm.ram_mb == 0 {
            return invalid(format!("VM '{}' must have a positive ram value", key));
        }
        if vm.cpu_cores == 0 {
            return invalid(format!("VM '{}' must have a positive cpu value", key));
        }
        if vm.ssh_port == 0 {
            return invalid(format!("VM '{}' is missing sshPort", key));
        }
        if vm.image_path.trim().is_empty() {
            return invalid(format!("VM '{}' is missing image", key));
        }

        let res = &vm.resources;
        if res.current_ram > res.max_ram {
            return invalid(format!(
                "VM '{}' currentRAM {} exceeds maxRAM {}",
                key, res.current_ram, res.max_ram
            ));
        }
        if res.current_cpu > res.max_cpu {
            return invalid(format!(
                "VM '{}' currentCPU {} exceeds maxCPU {}",
                key, res.current_cpu, res.max_cpu
            ));
        }

        if vm.status == VmState::Running {
            if let Some(other) = running_ports.insert(vm.ssh_port, key) {
                return invalid(format!(
                    "running VMs '{}' and '{}' share sshPort {}",
                    other, key, vm.ssh_port
                ));
            }
        }
    }

    Ok(())
}
