//! OpenAI-compatible chat completions backend
//!
//! Serves OpenAI itself and the providers that mirror its API (DeepSeek,
//! AiHubMix, Volcengine Ark).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{GenerationRequest, LlmConfig, LlmError, TextGenerator};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct OpenAiCompatibleClient {
    client: Client,
    provider: String,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider = config.provider.name().to_string();
        let base_url = config
            .resolved_base_url()
            .ok_or_else(|| LlmError::Client(format!("no base_url configured for {provider}")))?;
        let model = config
            .resolved_model()
            .ok_or_else(|| LlmError::MissingModel(provider.clone()))?;
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| LlmError::MissingApiKey {
                provider: provider.clone(),
                env_var: config.provider.api_key_env().to_string(),
            })?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::Client(e.to_string()))?;

        tracing::info!(
            "Initialized OpenAI-compatible client: provider={}, base_url={}, model={}",
            provider,
            base_url,
            model
        );

        Ok(Self {
            client,
            endpoint: chat_endpoint(&base_url),
            provider,
            model,
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn chat_endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

fn build_messages(request: &GenerationRequest) -> Vec<ChatMessage<'_>> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system_prompt.as_deref() {
        messages.push(ChatMessage {
            role: "system",
            content: system,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: &request.prompt,
    });
    messages
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(request),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        tracing::debug!(
            "Sending request to {}: model={}, prompt={}",
            self.endpoint,
            self.model,
            request.prompt.chars().take(100).collect::<String>()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| LlmError::Http {
                provider: self.provider.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => {
                let parsed: ChatResponse =
                    response.json().await.map_err(|source| LlmError::Http {
                        provider: self.provider.clone(),
                        source,
                    })?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .unwrap_or_default();
                tracing::debug!(
                    "Received response from {}: {}",
                    self.provider,
                    content.chars().take(100).collect::<String>()
                );
                Ok(content)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(LlmError::RateLimited(self.provider.clone())),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(LlmError::Status {
                    provider: self.provider.clone(),
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Provider;

    #[test]
    fn test_chat_endpoint() {
        assert_eq!(
            chat_endpoint("https://api.deepseek.com/v1/"),
            "https://api.deepseek.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_messages_include_system_prompt() {
        let request = GenerationRequest::new("hello").system("be brief");
        let json = serde_json::to_value(build_messages(&request)).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ])
        );
        assert_eq!(build_messages(&GenerationRequest::new("x")).len(), 1);
    }

    #[test]
    fn test_from_config_requires_model_for_ark() {
        let config = LlmConfig {
            provider: Provider::Ark,
            api_key: Some("key".to_string()),
            ..LlmConfig::default()
        };
        assert!(matches!(
            OpenAiCompatibleClient::from_config(&config),
            Err(LlmError::MissingModel(_))
        ));
    }

    #[test]
    fn test_from_config_uses_provider_defaults() {
        let config = LlmConfig {
            provider: Provider::Deepseek,
            api_key: Some("key".to_string()),
            ..LlmConfig::default()
        };
        let client = OpenAiCompatibleClient::from_config(&config).unwrap();
        assert_eq!(client.model(), "deepseek-chat");
        assert_eq!(
            client.endpoint(),
            "https://api.deepseek.com/v1/chat/completions"
        );
        assert_eq!(client.name(), "deepseek");
    }
}
