//! Model backend abstraction.
//!
//! Provides a unified interface over inference providers. The engine only
//! sees [`ModelBackend`]; provider adapters live outside this workspace.

use crate::error::ModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Available inference providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    /// Local Ollama instance.
    Ollama,
    /// Anthropic Claude API.
    Anthropic,
    /// OpenAI API.
    OpenAi,
    /// Generic OpenAI-compatible API.
    OpenAiCompatible,
}

/// Configuration for a model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBackendConfig {
    /// The provider type.
    pub provider: ModelProvider,
    /// Base URL for the API.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// API key (if required).
    pub api_key: Option<String>,
    /// Additional provider-specific options.
    pub options: HashMap<String, JsonValue>,
}

impl ModelBackendConfig {
    /// Creates a new Ollama backend configuration.
    #[must_use]
    pub fn ollama(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: ModelProvider::Ollama,
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            options: HashMap::new(),
        }
    }

    /// Creates a new Anthropic backend configuration.
    #[must_use]
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: ModelProvider::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            model: model.into(),
            api_key: Some(api_key.into()),
            options: HashMap::new(),
        }
    }
}

/// A request to a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The rendered prompt to send.
    pub prompt: String,
    /// System prompt, if any.
    pub system: Option<String>,
    /// Optional JSON schema for structured output.
    pub output_schema: Option<JsonValue>,
    /// Temperature for sampling (0.0 - 1.0).
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
}

impl ModelRequest {
    /// Creates a new simple request with just a prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            output_schema: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Adds a system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Adds an output schema for structured output.
    #[must_use]
    pub fn with_output_schema(mut self, schema: JsonValue) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the max tokens.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A response from a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The generated content.
    pub content: String,
    /// Structured output (if `output_schema` was provided).
    pub structured_output: Option<JsonValue>,
    /// Token usage statistics.
    pub usage: TokenUsage,
    /// Model that generated the response.
    pub model: String,
}

impl ModelResponse {
    /// Creates a plain-text response (for tests and canned backends).
    #[must_use]
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            structured_output: None,
            usage: TokenUsage::default(),
            model: model.into(),
        }
    }

    /// Returns the structured output if present, otherwise the content as a
    /// JSON string.
    #[must_use]
    pub fn output_value(&self) -> JsonValue {
        self.structured_output
            .clone()
            .unwrap_or_else(|| JsonValue::String(self.content.clone()))
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of input tokens.
    pub input_tokens: u32,
    /// Number of output tokens.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Returns the total number of tokens.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Trait for model backends.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Generates a response for the given request.
    ///
    /// # Errors
    ///
    /// Returns an error if the inference call fails.
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Returns the provider type.
    fn provider(&self) -> ModelProvider;

    /// Returns the model name.
    fn model(&self) -> &str;
}

/// A backend that replays a fixed sequence of responses (for tests).
///
/// Responses are consumed in order; running out yields `RequestFailed`.
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedBackend {
    /// Creates a scripted backend with the given responses.
    #[must_use]
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Returns the requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ModelRequest> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        if let Ok(mut guard) = self.requests.lock() {
            guard.push(request.clone());
        }
        let next = match self.responses.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.ok_or_else(|| ModelError::RequestFailed {
            reason: "scripted backend exhausted".to_string(),
        })
    }

    fn provider(&self) -> ModelProvider {
        ModelProvider::OpenAiCompatible
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// A backend whose every call fails (for tests).
pub struct FailingBackend {
    reason: String,
}

impl FailingBackend {
    /// Creates a failing backend with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ModelBackend for FailingBackend {
    async fn generate(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        Err(ModelError::RequestFailed {
            reason: self.reason.clone(),
        })
    }

    fn provider(&self) -> ModelProvider {
        ModelProvider::OpenAiCompatible
    }

    fn model(&self) -> &str {
        "failing"
    }
}
