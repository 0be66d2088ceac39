use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

const HOSTED_TIMEOUT: u64 = 30;
const LOCAL_TIMEOUT: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Claude,
    Ollama,
    OpenHands,
    Mock,
}

impl ProviderId {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Claude => "claude",
            ProviderId::Ollama => "ollama",
            ProviderId::OpenHands => "openhands",
            ProviderId::Mock => "mock",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderId::OpenAi),
            "claude" | "anthropic" => Ok(ProviderId::Claude),
            "ollama" => Ok(ProviderId::Ollama),
            "openhands" => Ok(ProviderId::OpenHands),
            "mock" | "none" | "offline" => Ok(ProviderId::Mock),
            _ => Err(s.to_string()),
        }
    }
}

/// Where a provider runs, which decides how long a call may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    Hosted,
    Local,
}

impl Locality {
    pub fn timeout(self) -> Duration {
        match self {
            Locality::Hosted => Duration::from_secs(HOSTED_TIMEOUT),
            Locality::Local => Duration::from_secs(LOCAL_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub id: ProviderId,
    pub display_name: String,
    pub base_endpoint: String,
    /// First entry is the default model.
    pub supported_models: Vec<String>,
    pub credential_env_var: Option<String>,
    pub description: String,
    pub locality: Locality,
}

impl ProviderSpec {
    fn new(
        id: ProviderId,
        display_name: &str,
        base_endpoint: &str,
        models: &[&str],
        credential_env_var: Option<&str>,
        description: &str,
        locality: Locality,
    ) -> Self {
        Self {
            id,
            display_name: display_name.to_string(),
            base_endpoint: base_endpoint.to_string(),
            supported_models: models.iter().map(|m| m.to_string()).collect(),
            credential_env_var: credential_env_var.map(String::from),
            description: description.to_string(),
            locality,
        }
    }

    pub fn default_model(&self) -> &str {
        self.supported_models
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// The providers known to the engine. Built once and injected.
#[derive(Debug, Clone)]
pub struct ProviderTable {
    providers: Vec<ProviderSpec>,
}

impl ProviderTable {
    pub fn new(providers: Vec<ProviderSpec>) -> Self {
        Self { providers }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ProviderSpec::new(
                ProviderId::OpenAi,
                "OpenAI",
                "https://api.openai.com/v1",
                &["gpt-4", "gpt-3.5-turbo"],
                Some("OPENAI_API_KEY"),
                "OpenAI GPT models (requires API key)",
                Locality::Hosted,
            ),
            ProviderSpec::new(
                ProviderId::Claude,
                "Anthropic Claude",
                "https://api.anthropic.com/v1",
                &[
                    "claude-3-haiku-20240307",
                    "claude-3-5-sonnet-latest",
                    "claude-3-opus-latest",
                ],
                Some("ANTHROPIC_API_KEY"),
                "Anthropic Claude models (requires API key)",
                Locality::Hosted,
            ),
            ProviderSpec::new(
                ProviderId::Ollama,
                "Ollama (Local)",
                "http://localhost:11434",
                &["llama2", "codellama", "mistral"],
                None,
                "Local Ollama models (no API key needed)",
                Locality::Local,
            ),
            ProviderSpec::new(
                ProviderId::OpenHands,
                "OpenHands",
                "http://localhost:3000",
                &["openhands"],
                None,
                "OpenHands AI assistant (local, interactive only)",
                Locality::Local,
            ),
            ProviderSpec::new(
                ProviderId::Mock,
                "Offline",
                "",
                &["offline"],
                None,
                "Built-in offline suggestions (no network)",
                Locality::Local,
            ),
        ])
    }

    pub fn get(&self, id: ProviderId) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.providers.iter()
    }

    /// Environment variables holding credentials, without duplicates.
    pub fn credential_vars(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for var in self.providers.iter().filter_map(|p| p.credential_env_var.as_deref()) {
            if !vars.contains(&var) {
                vars.push(var);
            }
        }
        vars
    }
}
