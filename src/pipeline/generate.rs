// Pipeline: LLM text generation backend
// Chat-completion client used by the generative persona strategy

use async_trait::async_trait;
use openai::Credentials;
use openai::chat::{
    ChatCompletion, ChatCompletionMessage, ChatCompletionMessageRole, ChatCompletionResponseFormat,
};
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, PipelineError};

pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const GROQ_DEFAULT_MODEL: &str = "llama-3.1-70b-versatile";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1/";

/// A chat backend that answers with a JSON document.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model(&self) -> &str;

    async fn complete_json(&self, system_prompt: &str, prompt: &str) -> Result<String, BackendError>;
}

/// Which hosted provider serves generative synthesis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GenerativeProvider {
    /// OpenAI if `OPENAI_API_KEY` is set, else Groq if `GROQ_API_KEY` is set
    Auto,
    #[value(name = "openai")]
    OpenAi,
    Groq,
}

/// Provider plus the credentials it will be called with
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub provider: GenerativeProvider,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

/// Configuration for LLM generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub provider: GenerativeProvider,
    pub model: Option<String>,

    /// 0.0 makes the backend as repeatable as it can be
    pub temperature: f32,
    pub max_completion_tokens: u32,

    /// Overrides the provider's default endpoint
    pub base_url: Option<String>,

    #[serde(skip)]
    pub openai_api_key: Option<String>,
    #[serde(skip)]
    pub groq_api_key: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerativeProvider::Auto,
            model: None,
            temperature: 0.2,
            max_completion_tokens: 1200,
            base_url: None,
            openai_api_key: None,
            groq_api_key: None,
        }
    }
}

impl GenerationConfig {
    /// Read API keys and endpoint overrides from the environment.
    /// Note: the openai crate expects OPENAI_KEY, so both spellings are accepted.
    pub fn with_env(mut self) -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        if self.openai_api_key.is_none() {
            self.openai_api_key = non_empty("OPENAI_API_KEY").or_else(|| non_empty("OPENAI_KEY"));
        }
        if self.groq_api_key.is_none() {
            self.groq_api_key = non_empty("GROQ_API_KEY");
        }
        if self.base_url.is_none() {
            self.base_url = non_empty("OPENAI_BASE_URL");
        }
        self
    }

    /// Pick the provider and credentials. `Ok(None)` means auto-selection
    /// found no key.
    pub fn resolve(&self) -> Result<Option<ResolvedProvider>, PipelineError> {
        let provider = match self.provider {
            GenerativeProvider::Auto => {
                if self.openai_api_key.is_some() {
                    GenerativeProvider::OpenAi
                } else if self.groq_api_key.is_some() {
                    GenerativeProvider::Groq
                } else {
                    return Ok(None);
                }
            }
            explicit => explicit,
        };

        let (api_key, default_base, default_model) = match provider {
            GenerativeProvider::Groq => (
                self.groq_api_key.clone().ok_or_else(|| {
                    PipelineError::config("groq provider selected but GROQ_API_KEY is not set")
                })?,
                GROQ_BASE_URL.to_string(),
                GROQ_DEFAULT_MODEL,
            ),
            _ => (
                self.openai_api_key.clone().ok_or_else(|| {
                    PipelineError::config("openai provider selected but OPENAI_API_KEY is not set")
                })?,
                String::new(),
                OPENAI_DEFAULT_MODEL,
            ),
        };

        Ok(Some(ResolvedProvider {
            provider,
            api_key,
            base_url: self.base_url.clone().unwrap_or(default_base),
            model: self.model.clone().unwrap_or_else(|| default_model.to_string()),
        }))
    }
}

/// Chat completions through the `openai` crate; Groq is reached through its
/// OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    credentials: Credentials,
    model: String,
    max_completion_tokens: u32,
    temperature: f32,
}

impl OpenAiGenerator {
    pub fn new(resolved: &ResolvedProvider, config: &GenerationConfig) -> Self {
        Self {
            credentials: Credentials::new(resolved.api_key.clone(), resolved.base_url.clone()),
            model: resolved.model.clone(),
            max_completion_tokens: config.max_completion_tokens,
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    /// Call OpenAI API with JSON mode
    async fn complete_json(&self, system_prompt: &str, prompt: &str) -> Result<String, BackendError> {
        let messages = vec![
            ChatCompletionMessage {
                role: ChatCompletionMessageRole::System,
                content: Some(system_prompt.to_string()),
                name: None,
                function_call: None,
                tool_call_id: None,
                tool_calls: None,
            },
            ChatCompletionMessage {
                role: ChatCompletionMessageRole::User,
                content: Some(prompt.to_string()),
                name: None,
                function_call: None,
                tool_call_id: None,
                tool_calls: None,
            },
        ];

        let response = ChatCompletion::builder(&self.model, messages)
            .credentials(self.credentials.clone())
            .max_completion_tokens(self.max_completion_tokens)
            .temperature(self.temperature)
            .response_format(ChatCompletionResponseFormat::json_object())
            .create()
            .await
            .map_err(|e| BackendError::Transient(format!("chat completion failed: {}", e)))?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| BackendError::MalformedOutput("no response content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(openai: Option<&str>, groq: Option<&str>) -> GenerationConfig {
        GenerationConfig {
            openai_api_key: openai.map(str::to_string),
            groq_api_key: groq.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn auto_prefers_openai() {
        let resolved = keys(Some("sk-1"), Some("gsk-1")).resolve().unwrap().unwrap();
        assert_eq!(resolved.provider, GenerativeProvider::OpenAi);
        assert_eq!(resolved.model, OPENAI_DEFAULT_MODEL);
    }

    #[test]
    fn auto_falls_back_to_groq() {
        let resolved = keys(None, Some("gsk-1")).resolve().unwrap().unwrap();
        assert_eq!(resolved.provider, GenerativeProvider::Groq);
        assert_eq!(resolved.base_url, GROQ_BASE_URL);
        assert_eq!(resolved.model, GROQ_DEFAULT_MODEL);
    }

    #[test]
    fn auto_without_keys_resolves_to_nothing() {
        assert!(keys(None, None).resolve().unwrap().is_none());
    }

    #[test]
    fn explicit_provider_without_key_is_fatal() {
        let config = GenerationConfig {
            provider: GenerativeProvider::Groq,
            ..keys(Some("sk-1"), None)
        };
        assert!(matches!(
            config.resolve(),
            Err(PipelineError::FatalConfiguration(_))
        ));
    }

    #[test]
    fn model_override_wins() {
        let config = GenerationConfig {
            model: Some("gpt-4.1-mini".to_string()),
            ..keys(Some("sk-1"), None)
        };
        assert_eq!(config.resolve().unwrap().unwrap().model, "gpt-4.1-mini");
    }
}
