//! Recommendation engine: asks the configured provider for suggestions and
//! falls back to the offline responder whenever it cannot answer.

pub mod client;
pub mod errors;
pub mod models;
pub mod offline;
pub mod providers;

#[cfg(test)]
pub(crate) mod test_server;

use log::{info, warn};
use serde::Serialize;

use crate::errors::{ConfigError, Result};
use crate::settings::AiSettings;

pub use self::models::{ConversationMessage, SuggestionResult};
use self::providers::{ProviderId, ProviderSpec, ProviderTable};

const PERSONA: &str = "You are an assistant for avm, a manager for local virtual machines. \
Give concise, actionable suggestions for VM management, Docker, development environments \
and troubleshooting. Put each shell command on its own line with nothing else on it, and \
start any caution with \"Warning:\".";

/// One row of the provider overview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOverview {
    pub id: ProviderId,
    pub display_name: String,
    pub description: String,
    pub default_model: String,
    /// Credential present, or none needed.
    pub usable: bool,
    pub active: bool,
}

pub struct RecommendationEngine {
    settings: AiSettings,
    table: ProviderTable,
}

impl RecommendationEngine {
    pub fn new(settings: AiSettings) -> Self {
        Self::with_table(settings, ProviderTable::builtin())
    }

    pub fn with_table(settings: AiSettings, table: ProviderTable) -> Self {
        Self { settings, table }
    }

    fn active_spec(&self) -> std::result::Result<&ProviderSpec, ConfigError> {
        let unknown = || ConfigError::UnknownProvider(self.settings.provider.clone());
        let id: ProviderId = self.settings.provider.parse().map_err(|_| unknown())?;
        self.table.get(id).ok_or_else(unknown)
    }

    /// Suggestions for `query`. Only an unknown provider id is an error;
    /// any provider failure degrades to the offline responder.
    pub async fn get_suggestions(&self, query: &str) -> Result<SuggestionResult> {
        let spec = self.active_spec()?;
        let messages = vec![
            ConversationMessage::system(PERSONA),
            ConversationMessage::user(query),
        ];

        let credential = match &spec.credential_env_var {
            Some(var) => match self.settings.credential(var) {
                Some(value) => Some(value),
                None => {
                    warn!("{} API key not found in {}", spec.display_name, var);
                    return Ok(degraded(
                        &messages,
                        format!(
                            "{} API key not found in {}; showing offline suggestions",
                            spec.display_name, var
                        ),
                    ));
                }
            },
            None => None,
        };

        let endpoint = self
            .settings
            .endpoint
            .as_deref()
            .unwrap_or(spec.base_endpoint.as_str());
        let model = self
            .settings
            .model
            .as_deref()
            .unwrap_or_else(|| spec.default_model());

        info!("Asking {} ({}) for suggestions", spec.display_name, model);
        let answer = match client::connect(spec, endpoint, credential) {
            Ok(provider) => provider.converse(&messages, model).await,
            Err(e) => Err(e),
        };

        match answer {
            Ok(text) if !text.trim().is_empty() => Ok(offline::normalize(&text)),
            Ok(_) => {
                warn!("{} returned an empty answer", spec.display_name);
                Ok(degraded(
                    &messages,
                    format!("{} returned no answer; showing offline suggestions", spec.display_name),
                ))
            }
            Err(e) => {
                warn!("{} call failed, using fallback: {}", spec.display_name, e);
                Ok(degraded(
                    &messages,
                    format!("{} unavailable ({}); showing offline suggestions", spec.display_name, e),
                ))
            }
        }
    }

    /// Every known provider and whether it can be used right now.
    pub fn provider_overview(&self) -> Vec<ProviderOverview> {
        let active = self.active_spec().ok().map(|s| s.id);
        self.table
            .iter()
            .map(|spec| ProviderOverview {
                id: spec.id,
                display_name: spec.display_name.clone(),
                description: spec.description.clone(),
                default_model: spec.default_model().to_string(),
                usable: spec
                    .credential_env_var
                    .as_deref()
                    .map_or(true, |var| self.settings.credential(var).is_some()),
                active: active == Some(spec.id),
            })
            .collect()
    }
}

fn degraded(messages: &[ConversationMessage], warning: String) -> SuggestionResult {
    let mut result = offline::normalize(offline::respond(messages));
    result.warnings.insert(0, warning);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AvmError;
    use crate::recommend::test_server::serve_once;

    fn settings(provider: &str) -> AiSettings {
        AiSettings {
            provider: provider.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_provider_is_config_error() {
        let engine = RecommendationEngine::new(settings("gemini"));
        let err = engine.get_suggestions("help").await.unwrap_err();
        assert!(matches!(
            err,
            AvmError::Config(ConfigError::UnknownProvider(ref p)) if p == "gemini"
        ));
    }

    #[tokio::test]
    async fn test_missing_credential_skips_network() {
        let mut ai = settings("openai");
        // Would fail loudly if a request were attempted
        ai.endpoint = Some("http://127.0.0.1:1".into());
        let engine = RecommendationEngine::new(ai);

        let result = engine.get_suggestions("docker setup").await.unwrap();
        assert!(result.commands.iter().any(|c| c.starts_with("docker")));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("OPENAI_API_KEY"));
    }

    #[tokio::test]
    async fn test_unreachable_provider_falls_back() {
        let mut ai = settings("ollama");
        ai.endpoint = Some("http://127.0.0.1:1".into());
        let engine = RecommendationEngine::new(ai);

        let result = engine.get_suggestions("what now").await.unwrap();
        assert_eq!(result.suggestions.len(), 3);
        assert_eq!(result.commands.len(), 3);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("Ollama"));
    }

    #[tokio::test]
    async fn test_live_answer_is_normalized() {
        let (base, _request) = serve_once(
            "200 OK",
            r#"{"response":"Give the VM more memory.\navm vm resources scale dev --ram 4096\nWarning: restart required","done":true}"#,
        )
        .await;
        let mut ai = settings("ollama");
        ai.endpoint = Some(base);
        ai.model = Some("mistral".into());
        let engine = RecommendationEngine::new(ai);

        let result = engine.get_suggestions("slow builds").await.unwrap();
        assert_eq!(result.suggestions, vec!["Give the VM more memory."]);
        assert_eq!(result.commands, vec!["avm vm resources scale dev --ram 4096"]);
        assert_eq!(result.warnings, vec!["restart required"]);
    }

    #[tokio::test]
    async fn test_empty_answer_falls_back() {
        let (base, _request) = serve_once("200 OK", r#"{"response":"   ","done":true}"#).await;
        let mut ai = settings("ollama");
        ai.endpoint = Some(base);
        let engine = RecommendationEngine::new(ai);

        let result = engine.get_suggestions("help").await.unwrap();
        assert!(result.commands.contains(&"avm start".to_string()));
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_openhands_degrades_with_warning() {
        let engine = RecommendationEngine::new(settings("openhands"));
        let result = engine.get_suggestions("first boot").await.unwrap();
        // Degradation warning plus the two from the first-boot reply
        assert_eq!(result.warnings.len(), 3);
        assert!(result.warnings[0].contains("OpenHands"));
    }

    #[tokio::test]
    async fn test_mock_provider_has_no_degradation_warning() {
        let mut ai = settings("none");
        // The offline adapter never touches the endpoint
        ai.endpoint = Some("http://127.0.0.1:1".into());
        let engine = RecommendationEngine::new(ai);
        let result = engine.get_suggestions("anything else").await.unwrap();
        assert!(result.warnings.is_empty());
        assert_eq!(result.commands.len(), 3);
    }

    #[test]
    fn test_provider_overview() {
        let mut ai = settings("claude");
        ai.credentials
            .insert("ANTHROPIC_API_KEY".into(), "ak-test".into());
        let overview = RecommendationEngine::new(ai).provider_overview();

        let row = |id| overview.iter().find(|p| p.id == id).unwrap();
        assert!(row(ProviderId::Claude).usable);
        assert!(row(ProviderId::Claude).active);
        assert!(!row(ProviderId::OpenAi).usable);
        assert!(row(ProviderId::Ollama).usable);
        assert!(!row(ProviderId::Ollama).active);
    }
}
