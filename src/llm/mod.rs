//! Text generation providers
//!
//! Every backend implements [`TextGenerator::generate`]; the JSON-flavored
//! [`TextGenerator::generate_json`] is shared and retries on malformed output.

pub mod mock;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub use openai::OpenAiCompatibleClient;

/// Appended to prompts whose reply must parse as JSON.
pub const JSON_INSTRUCTION: &str =
    "Respond strictly in JSON format. Do not include any explanatory text or code fence markers.";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Failed to reach {provider}: {source}")]
    Http {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} API error {status}: {message}")]
    Status {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Rate limit exceeded for {0}, try again later")]
    RateLimited(String),

    #[error("No API key configured for {provider} (set {env_var})")]
    MissingApiKey { provider: String, env_var: String },

    #[error("No model configured for provider {0}")]
    MissingModel(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,

    #[error("Model output was not valid JSON after {attempts} attempts: {last_error}")]
    MalformedJson { attempts: u32, last_error: String },

    #[error("Failed to create HTTP client: {0}")]
    Client(String),
}

impl LlmError {
    /// Errors worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http { source, .. } => source.is_timeout() || source.is_connect(),
            LlmError::Status { status, .. } => *status >= 500,
            LlmError::RateLimited(_) | LlmError::EmptyResponse => true,
            _ => false,
        }
    }
}

/// One prompt with its sampling settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }

    pub fn system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// How `generate_json` retries malformed output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JsonRetryPolicy {
    /// Additional attempts after the first
    pub retries: u32,
    pub pause: Duration,
}

impl Default for JsonRetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            pause: Duration::from_secs(1),
        }
    }
}

/// Remove surrounding whitespace and a ```` ```json ```` fence, if present.
pub fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let text = text.strip_prefix("```json").unwrap_or(text);
    let text = text.strip_suffix("```").unwrap_or(text);
    text.trim()
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Provider name, for log messages.
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;

    /// Generate and parse a JSON reply.
    ///
    /// Makes up to `policy.retries + 1` attempts, pausing between them. Both
    /// provider failures and unparseable output count as a failed attempt.
    async fn generate_json(
        &self,
        request: &GenerationRequest,
        policy: &JsonRetryPolicy,
    ) -> Result<Value, LlmError> {
        let mut request = request.clone();
        request.prompt = format!("{}\n\n{}", request.prompt, JSON_INSTRUCTION);
        let attempts = policy.retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.generate(&request).await {
                Ok(text) => match serde_json::from_str::<Value>(strip_code_fence(&text)) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        tracing::warn!(
                            "{} returned invalid JSON (attempt {}/{}): {}. Raw text: {}",
                            self.name(),
                            attempt,
                            attempts,
                            e,
                            text.chars().take(500).collect::<String>()
                        );
                        last_error = Some(LlmError::MalformedJson {
                            attempts,
                            last_error: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        "{} request failed (attempt {}/{}): {}",
                        self.name(),
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(policy.pause).await;
            }
        }

        Err(last_error.unwrap_or(LlmError::EmptyResponse))
    }
}

/// Known OpenAI-compatible providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Openai,
    Deepseek,
    Aihubmix,
    Ark,
    Custom,
}

impl Provider {
    pub fn name(self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Deepseek => "deepseek",
            Provider::Aihubmix => "aihubmix",
            Provider::Ark => "ark",
            Provider::Custom => "custom",
        }
    }

    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            Provider::Openai => Some("https://api.openai.com/v1"),
            Provider::Deepseek => Some("https://api.deepseek.com/v1"),
            Provider::Aihubmix => Some("https://aihubmix.com/v1"),
            Provider::Ark => Some("https://ark.cn-beijing.volces.com/api/v3"),
            Provider::Custom => None,
        }
    }

    /// Ark needs an endpoint id, so it has no default model.
    pub fn default_model(self) -> Option<&'static str> {
        match self {
            Provider::Openai => Some("gpt-3.5-turbo"),
            Provider::Deepseek => Some("deepseek-chat"),
            Provider::Aihubmix => Some("gpt-4o-mini"),
            Provider::Ark | Provider::Custom => None,
        }
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            Provider::Openai | Provider::Custom => "OPENAI_API_KEY",
            Provider::Deepseek => "DEEPSEEK_API_KEY",
            Provider::Aihubmix => "AIHUBMIX_API_KEY",
            Provider::Ark => "ARK_API_KEY",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::Openai),
            "deepseek" => Ok(Provider::Deepseek),
            "aihubmix" => Ok(Provider::Aihubmix),
            "ark" | "volcengine" => Ok(Provider::Ark),
            "custom" => Ok(Provider::Custom),
            other => Err(format!("Unsupported LLM provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: Provider,

    /// Overrides the provider's default endpoint
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// Falls back to the provider's environment variable when unset
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    #[serde(default = "default_json_retries")]
    pub json_retries: u32,

    #[serde(with = "humantime_serde", default = "default_retry_pause")]
    pub retry_pause: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_json_retries() -> u32 {
    2
}

fn default_retry_pause() -> Duration {
    Duration::from_secs(1)
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            base_url: None,
            model: None,
            api_key: None,
            request_timeout: default_request_timeout(),
            json_retries: default_json_retries(),
            retry_pause: default_retry_pause(),
        }
    }
}

impl LlmConfig {
    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| self.provider.default_base_url().map(str::to_string))
    }

    pub fn resolved_model(&self) -> Option<String> {
        self.model
            .clone()
            .or_else(|| self.provider.default_model().map(str::to_string))
    }

    /// Configured key, else the provider's environment variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| std::env::var(self.provider.api_key_env()).ok())
            .filter(|key| !key.is_empty())
    }

    pub fn json_policy(&self) -> JsonRetryPolicy {
        JsonRetryPolicy {
            retries: self.json_retries,
            pause: self.retry_pause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedGenerator;
    use super::*;
    use serde_json::json;

    fn fast_policy() -> JsonRetryPolicy {
        JsonRetryPolicy {
            retries: 2,
            pause: Duration::ZERO,
        }
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json{}```"), "{}");
    }

    #[tokio::test]
    async fn test_generate_json_appends_instruction() {
        let generator = ScriptedGenerator::new(["{\"ok\": true}"]);
        let value = generator
            .generate_json(&GenerationRequest::new("plan"), &fast_policy())
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));

        let requests = generator.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.starts_with("plan"));
        assert!(requests[0].prompt.ends_with(JSON_INSTRUCTION));
    }

    #[tokio::test]
    async fn test_generate_json_retries_malformed_output() {
        let generator = ScriptedGenerator::new(["not json", "```json\n{\"n\": 2}\n```"]);
        let value = generator
            .generate_json(&GenerationRequest::new("x"), &fast_policy())
            .await
            .unwrap();
        assert_eq!(value, json!({"n": 2}));
        assert_eq!(generator.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_generate_json_gives_up_after_all_attempts() {
        let generator = ScriptedGenerator::new(["a", "b", "c", "{}"]);
        let err = generator
            .generate_json(&GenerationRequest::new("x"), &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedJson { attempts: 3, .. }));
        assert_eq!(generator.requests().len(), 3);
    }

    #[test]
    fn test_provider_defaults() {
        assert_eq!(
            Provider::Deepseek.default_base_url(),
            Some("https://api.deepseek.com/v1")
        );
        assert_eq!(Provider::Ark.default_model(), None);
        assert_eq!("VolcEngine".parse::<Provider>().unwrap(), Provider::Ark);
        assert!("anthropic".parse::<Provider>().is_err());
    }

    #[test]
    fn test_config_resolution() {
        let config: LlmConfig = toml::from_str(
            r#"
            provider = "aihubmix"
            api_key = "sk-test"
            request_timeout = "30s"
            "#,
        )
        .unwrap();
        assert_eq!(config.resolved_base_url().as_deref(), Some("https://aihubmix.com/v1"));
        assert_eq!(config.resolved_model().as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.resolved_api_key().as_deref(), Some("sk-test"));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.json_policy().retries, 2);
    }
}
