use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::rules::FirewallRule;

/// Host firewall access. Kept behind a trait so rule application can be
/// exercised without root.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn apply(&self, rule: &FirewallRule) -> Result<()>;

    /// Every rule of the INPUT chain, one `iptables -S` style line each.
    async fn list(&self) -> Result<Vec<String>>;

    /// Delete the rule printed as `line` by [`FirewallBackend::list`].
    async fn remove(&self, line: &str) -> Result<()>;
}

pub struct IptablesBackend {
    program: String,
}

impl IptablesBackend {
    pub fn new() -> Self {
        Self {
            program: "iptables".to_string(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!("Running {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} failed: {}", self.program, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    async fn apply(&self, rule: &FirewallRule) -> Result<()> {
        self.run(&rule.to_iptables_args()).await.map(|_| ())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let out = self.run(&["-S".to_string(), "INPUT".to_string()]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn remove(&self, line: &str) -> Result<()> {
        let Some(args) = super::rules::delete_args(line) else {
            bail!("not a rule line: {}", line);
        };
        self.run(&args).await.map(|_| ())
    }
}
