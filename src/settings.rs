use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::recommend::providers::ProviderTable;

const DEFAULT_CONFIG_PATH: &str = "~/.avm/config.json";
const DEFAULT_HYPERVISOR: &str = "qemu-system-x86_64";
const DEFAULT_PROVIDER: &str = "ollama";

/// Process-wide settings, read once at startup and handed to every component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub hypervisor: HypervisorSettings,
    pub ai: AiSettings,
}

/// How the VM process is launched.
///
/// `prefix_args` come before the generated VM arguments, which lets a wrapper
/// such as `proot-distro login alpine --` sit in front of QEMU.
#[derive(Debug, Clone)]
pub struct HypervisorSettings {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_HYPERVISOR.to_string(),
            prefix_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiSettings {
    /// Raw provider selector; validated against the provider table per request.
    pub provider: String,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    /// Credential values keyed by environment variable name.
    pub credentials: HashMap<String, String>,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: None,
            endpoint: None,
            credentials: HashMap::new(),
        }
    }
}

impl AiSettings {
    pub fn credential(&self, env_var: &str) -> Option<&str> {
        self.credentials
            .get(env_var)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_env_for(&ProviderTable::builtin())
    }

    /// Like `from_env`, reading the credential variables `providers` name.
    pub fn from_env_for(providers: &ProviderTable) -> Self {
        let config_path = non_empty_var("AVM_CONFIG")
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut hypervisor = HypervisorSettings::default();
        if let Some(program) = non_empty_var("AVM_HYPERVISOR") {
            // Split so "proot-distro login alpine -- qemu-system-x86_64" works
            let mut parts = program.split_whitespace().map(String::from);
            if let Some(first) = parts.next() {
                hypervisor.program = first;
                hypervisor.prefix_args = parts.collect();
            }
        }

        let mut credentials = HashMap::new();
        for var in providers.credential_vars() {
            if let Some(value) = non_empty_var(var) {
                credentials.insert(var.to_string(), value);
            }
        }

        Settings {
            config_path: expand_home(Path::new(&config_path)),
            hypervisor,
            ai: AiSettings {
                provider: non_empty_var("AVM_AI_PROVIDER")
                    .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
                model: non_empty_var("AVM_AI_MODEL"),
                endpoint: non_empty_var("AVM_AI_ENDPOINT"),
                credentials,
            },
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
