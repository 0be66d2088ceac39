//! Per-VM network isolation on the host firewall.

pub mod firewall;
pub mod rules;

use std::fmt;

use log::{info, warn};
use serde::Serialize;

use crate::config::VmDefinition;
use crate::errors::{AvmError, Conflict, Result};
use crate::supervisor;

use self::firewall::{FirewallBackend, IptablesBackend};
use self::rules::{build_rules, comment_owner, extract_comment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IsolationMode {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "isolated")]
    Isolated,
    #[serde(rename = "isolated+vpn")]
    IsolatedVpn,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationMode::Open => write!(f, "open"),
            IsolationMode::Isolated => write!(f, "isolated"),
            IsolationMode::IsolatedVpn => write!(f, "isolated+vpn"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationReport {
    pub vm: String,
    pub mode: IsolationMode,
    pub forwarded_port: u16,
    /// Rules the firewall accepted, rendered as iptables arguments.
    pub applied: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub vm: String,
    pub mode: IsolationMode,
    pub forwarded_port: u16,
    pub active_rules: Vec<String>,
}

pub struct NetworkIsolationManager {
    backend: Box<dyn FirewallBackend>,
}

impl NetworkIsolationManager {
    pub fn new(backend: Box<dyn FirewallBackend>) -> Self {
        Self { backend }
    }

    /// Restrict inbound traffic on the VM's forwarded SSH port to `allow_list`.
    ///
    /// Previous rules for the VM are replaced. Rules are applied one by one;
    /// a rule the firewall rejects becomes a warning in the report.
    pub async fn isolate(
        &self,
        def: &VmDefinition,
        allow_list: &[String],
        vpn: bool,
    ) -> Result<IsolationReport> {
        if supervisor::live_pid(def).is_none() {
            return Err(AvmError::conflict(&def.name, Conflict::NotRunning));
        }

        let (rules, mut warnings) = build_rules(&def.name, def.ssh_port, allow_list, vpn);
        warnings.extend(self.clear(&def.name).await);

        // Rules are inserted at the head of the chain, so apply the deny
        // first and each allow ends up ahead of it.
        let mut applied = Vec::new();
        for rule in &rules {
            match self.backend.apply(rule).await {
                Ok(()) => applied.push(rule.to_string()),
                Err(e) => {
                    warn!("Failed to apply firewall rule for VM '{}': {:#}", def.name, e);
                    warnings.push(format!("Failed to apply rule '{}': {:#}", rule, e));
                }
            }
        }

        let mode = if vpn {
            IsolationMode::IsolatedVpn
        } else {
            IsolationMode::Isolated
        };
        info!(
            "VM '{}' network {} on port {} ({} of {} rules applied)",
            def.name,
            mode,
            def.ssh_port,
            applied.len(),
            rules.len()
        );

        Ok(IsolationReport {
            vm: def.name.clone(),
            mode,
            forwarded_port: def.ssh_port,
            applied,
            warnings,
        })
    }

    /// Firewall rules currently tagged for the VM. Read-only.
    pub async fn status(&self, def: &VmDefinition) -> Result<NetworkStatus> {
        let lines = self.backend.list().await.map_err(|e| {
            AvmError::process(&def.name, format!("failed to list firewall rules: {:#}", e))
        })?;

        let mut mode = IsolationMode::Open;
        let mut active_rules = Vec::new();
        for line in lines {
            let Some(comment) = extract_comment(&line) else {
                continue;
            };
            let Some((vm, vpn)) = comment_owner(&comment) else {
                continue;
            };
            if vm != def.name {
                continue;
            }
            mode = match (mode, vpn) {
                (_, true) | (IsolationMode::IsolatedVpn, _) => IsolationMode::IsolatedVpn,
                _ => IsolationMode::Isolated,
            };
            active_rules.push(line);
        }

        Ok(NetworkStatus {
            vm: def.name.clone(),
            mode,
            forwarded_port: def.ssh_port,
            active_rules,
        })
    }

    async fn clear(&self, vm: &str) -> Vec<String> {
        let lines = match self.backend.list().await {
            Ok(lines) => lines,
            Err(e) => {
                return vec![format!("Could not read existing rules: {:#}", e)];
            }
        };

        let mut warnings = Vec::new();
        for line in lines {
            let owned = extract_comment(&line)
                .as_deref()
                .and_then(comment_owner)
                .is_some_and(|(owner, _)| owner == vm);
            if !owned {
                continue;
            }
            if let Err(e) = self.backend.remove(&line).await {
                warnings.push(format!("Could not remove old rule '{}': {:#}", line, e));
            }
        }
        warnings
    }
}

impl Default for NetworkIsolationManager {
    fn default() -> Self {
        Self::new(Box::new(IptablesBackend::new()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::rules::FirewallRule;
    use super::*;
    use crate::config::NewVm;
    use crate::supervisor::pidfile;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// In-memory firewall mimicking `iptables -I` / `-S` / `-D`.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingFirewall {
        pub chain: Arc<Mutex<Vec<String>>>,
        pub applied: Arc<Mutex<Vec<FirewallRule>>>,
        pub reject_sources: Vec<String>,
    }

    #[async_trait]
    impl FirewallBackend for RecordingFirewall {
        async fn apply(&self, rule: &FirewallRule) -> anyhow::Result<()> {
            if let Some(source) = &rule.source {
                if self.reject_sources.contains(source) {
                    bail!("iptables: host/network '{}' not found", source);
                }
            }
            self.applied.lock().unwrap().push(rule.clone());
            let line = rule.to_string().replacen("-I ", "-A ", 1);
            self.chain.lock().unwrap().insert(0, line);
            Ok(())
        }

        async fn list(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.chain.lock().unwrap().clone())
        }

        async fn remove(&self, line: &str) -> anyhow::Result<()> {
            self.chain.lock().unwrap().retain(|l| l != line);
            Ok(())
        }
    }

    fn vm(dir: &Path, live: bool) -> VmDefinition {
        let mut def = VmDefinition::new(
            NewVm {
                name: "dev".into(),
                ram_mb: 1024,
                cpu_cores: 1,
                ssh_port: 2222,
                image_path: "/images/dev.qcow2".into(),
            },
            dir,
        );
        def.pid_file = dir.join("dev.pid").to_string_lossy().to_string();
        if live {
            pidfile::write(&def.pid_file_path(), std::process::id()).unwrap();
        }
        def
    }

    #[tokio::test]
    async fn test_isolate_requires_running_vm() {
        let dir = tempfile::tempdir().unwrap();
        let firewall = RecordingFirewall::default();
        let manager = NetworkIsolationManager::new(Box::new(firewall.clone()));

        let err = manager
            .isolate(&vm(dir.path(), false), &["10.0.0.1".into()], false)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AvmError::StateConflict {
                conflict: Conflict::NotRunning,
                ..
            }
        ));
        assert!(firewall.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_isolate_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let firewall = RecordingFirewall::default();
        let manager = NetworkIsolationManager::new(Box::new(firewall.clone()));
        let def = vm(dir.path(), true);

        let report = manager
            .isolate(&def, &["10.0.0.1".into(), "10.0.1.0/24".into()], true)
            .await
            .unwrap();
        assert_eq!(report.mode, IsolationMode::IsolatedVpn);
        assert_eq!(report.applied.len(), 3);
        assert!(report.warnings.is_empty());
        assert!(report.applied[0].ends_with("-j DROP"));

        let status = manager.status(&def).await.unwrap();
        assert_eq!(status.mode, IsolationMode::IsolatedVpn);
        assert_eq!(status.forwarded_port, 2222);
        assert_eq!(status.active_rules.len(), 3);
        // Allows were inserted after the deny, so they are evaluated first
        assert!(status.active_rules[0].contains("-s 10.0.1.0/24"));
        assert!(status.active_rules[2].ends_with("-j DROP"));
    }

    #[tokio::test]
    async fn test_isolate_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let firewall = RecordingFirewall {
            reject_sources: vec!["10.0.0.2".into()],
            ..Default::default()
        };
        let manager = NetworkIsolationManager::new(Box::new(firewall.clone()));

        let report = manager
            .isolate(
                &vm(dir.path(), true),
                &["10.0.0.1".into(), "10.0.0.2".into(), "bogus".into()],
                false,
            )
            .await
            .unwrap();

        assert_eq!(report.mode, IsolationMode::Isolated);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings.iter().any(|w| w.contains("bogus")));
        assert!(report.warnings.iter().any(|w| w.contains("10.0.0.2")));
    }

    #[tokio::test]
    async fn test_isolate_replaces_previous_rules() {
        let dir = tempfile::tempdir().unwrap();
        let firewall = RecordingFirewall::default();
        firewall
            .chain
            .lock()
            .unwrap()
            .push("-A INPUT -p tcp --dport 80 -m comment --comment avm:web -j DROP".into());
        let manager = NetworkIsolationManager::new(Box::new(firewall.clone()));
        let def = vm(dir.path(), true);

        manager.isolate(&def, &["10.0.0.1".into()], false).await.unwrap();
        manager.isolate(&def, &[], false).await.unwrap();

        let chain = firewall.chain.lock().unwrap().clone();
        assert_eq!(chain.len(), 2);
        assert!(chain.iter().any(|l| l.contains("avm:web")));

        let status = manager.status(&def).await.unwrap();
        assert_eq!(status.mode, IsolationMode::Isolated);
        assert_eq!(status.active_rules.len(), 1);
    }

    #[tokio::test]
    async fn test_status_without_rules_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let manager = NetworkIsolationManager::new(Box::new(RecordingFirewall::default()));

        let status = manager.status(&vm(dir.path(), false)).await.unwrap();
        assert_eq!(status.mode, IsolationMode::Open);
        assert!(status.active_rules.is_empty());
    }
}
