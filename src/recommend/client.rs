use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use super::errors::ProviderError;
use super::models::{
    ChatCompletionRequest, ChatCompletionResponse, ConversationMessage, GenerateRequest,
    GenerateResponse, MessagesRequest, MessagesResponse, Role,
};
use super::offline;
use super::providers::{ProviderId, ProviderSpec};

const CONNECT_TIMEOUT: u64 = 10;
const MAX_TOKENS: u32 = 1000;
const TEMPERATURE: f32 = 0.7;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One conversational backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn converse(
        &self,
        messages: &[ConversationMessage],
        model: &str,
    ) -> Result<String, ProviderError>;
}

/// Build the adapter for `spec`, talking to `endpoint`.
pub fn connect(
    spec: &ProviderSpec,
    endpoint: &str,
    credential: Option<&str>,
) -> Result<Box<dyn ChatProvider>, ProviderError> {
    let api_key = credential.unwrap_or_default().to_string();

    Ok(match spec.id {
        ProviderId::OpenAi => Box::new(OpenAiProvider {
            client: http_client(spec.locality.timeout())?,
            url: join(endpoint, "chat/completions")?,
            api_key,
        }),
        ProviderId::Claude => Box::new(ClaudeProvider {
            client: http_client(spec.locality.timeout())?,
            url: join(endpoint, "messages")?,
            api_key,
        }),
        ProviderId::Ollama => Box::new(OllamaProvider {
            client: http_client(spec.locality.timeout())?,
            url: join(endpoint, "api/generate")?,
        }),
        ProviderId::OpenHands => Box::new(OpenHandsProvider),
        ProviderId::Mock => Box::new(MockProvider),
    })
}

fn http_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(ProviderError::from)
}

/// Join `path` onto `base`, keeping any path `base` already has.
fn join(base: &str, path: &str) -> Result<Url, ProviderError> {
    let mut base = Url::parse(base)?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    Ok(base.join(path)?)
}

/// Decode a provider body. A body that does not parse on an error status is
/// reported with the status; a body that does not parse on success is
/// malformed.
fn decode<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, ProviderError> {
    match serde_json::from_str::<T>(body) {
        Ok(parsed) => Ok(parsed),
        Err(_) if !status.is_success() => Err(ProviderError::ApiError(format!(
            "{}: {}",
            status,
            body.trim()
        ))),
        Err(e) => Err(ProviderError::InvalidResponse(e.to_string())),
    }
}

fn check_status(status: StatusCode) -> Result<(), ProviderError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ProviderError::ApiError(format!("HTTP {}", status)))
    }
}

pub struct OpenAiProvider {
    client: Client,
    url: Url,
    api_key: String,
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn converse(
        &self,
        messages: &[ConversationMessage],
        model: &str,
    ) -> Result<String, ProviderError> {
        let request = ChatCompletionRequest {
            model,
            messages,
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        debug!("POST {} (model {})", self.url, model);
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed: ChatCompletionResponse = decode(status, &body)?;
        if let Some(error) = parsed.error.filter(|e| !e.message.is_empty()) {
            return Err(ProviderError::ApiError(error.message));
        }
        check_status(status)?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".to_string()))
    }
}

pub struct ClaudeProvider {
    client: Client,
    url: Url,
    api_key: String,
}

#[async_trait]
impl ChatProvider for ClaudeProvider {
    async fn converse(
        &self,
        messages: &[ConversationMessage],
        model: &str,
    ) -> Result<String, ProviderError> {
        // The messages API takes the system prompt as a separate field
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let request = MessagesRequest {
            model,
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            system: (!system.is_empty()).then(|| system.join("\n")),
            messages: messages.iter().filter(|m| m.role != Role::System).collect(),
        };

        debug!("POST {} (model {})", self.url, model);
        let response = self
            .client
            .post(self.url.clone())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed: MessagesResponse = decode(status, &body)?;
        if let Some(error) = parsed.error.filter(|e| !e.message.is_empty()) {
            return Err(ProviderError::ApiError(error.message));
        }
        check_status(status)?;

        let text: Vec<String> = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "no text content in response".to_string(),
            ));
        }
        Ok(text.join("\n"))
    }
}

pub struct OllamaProvider {
    client: Client,
    url: Url,
}

/// Flatten a conversation into the single prompt `/api/generate` expects.
pub fn ollama_prompt(messages: &[ConversationMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        match message.role {
            Role::System => prompt.push_str(&message.content),
            Role::User => {
                prompt.push_str("User: ");
                prompt.push_str(&message.content);
            }
            Role::Assistant => {
                prompt.push_str("Assistant: ");
                prompt.push_str(&message.content);
            }
        }
        prompt.push('\n');
    }
    prompt
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    async fn converse(
        &self,
        messages: &[ConversationMessage],
        model: &str,
    ) -> Result<String, ProviderError> {
        let request = GenerateRequest {
            model,
            prompt: ollama_prompt(messages),
            stream: false,
        };

        debug!("POST {} (model {})", self.url, model);
        let response = self.client.post(self.url.clone()).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed: GenerateResponse = decode(status, &body)?;
        if let Some(error) = parsed.error.filter(|e| !e.is_empty()) {
            return Err(ProviderError::ApiError(error));
        }
        check_status(status)?;
        Ok(parsed.response)
    }
}

/// OpenHands is an interactive assistant without a conversational HTTP API.
pub struct OpenHandsProvider;

#[async_trait]
impl ChatProvider for OpenHandsProvider {
    async fn converse(
        &self,
        _messages: &[ConversationMessage],
        _model: &str,
    ) -> Result<String, ProviderError> {
        info!("Tip: run 'openhands' directly in a terminal for the full assistant");
        Err(ProviderError::Unavailable(
            "OpenHands has no conversational API".to_string(),
        ))
    }
}

pub struct MockProvider;

#[async_trait]
impl ChatProvider for MockProvider {
    async fn converse(
        &self,
        messages: &[ConversationMessage],
        _model: &str,
    ) -> Result<String, ProviderError> {
        Ok(offline::respond(messages).to_string())
    }
}
