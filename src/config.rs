use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentConfig, DEFAULT_INSTRUCTION};
use crate::error::ConfigError;
use crate::llm::{
    AnthropicModel, AnthropicModelConfig, ChatModel, ModelPricing, OpenAiCompatModel,
    OpenAiCompatModelConfig, RetryPolicy,
};

/// Complete configuration for an evaluation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub model: ModelConfig,
    pub retry: RetryConfig,
    pub agent: AgentSettings,
    pub env: EnvConfig,
}

impl EvalConfig {
    /// Reads a JSON config file. Missing sections and fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    /// Any endpoint speaking the OpenAI chat-completions format.
    Openai,
    Anthropic,
}

/// Model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    /// Model identifier (e.g. "gpt-4o-mini").
    pub model: String,
    /// Base URL override, e.g. a LiteLLM proxy.
    pub api_base: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub pricing: ModelPricing,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Openai,
            model: "gpt-4o-mini".into(),
            api_base: None,
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.0,
            max_tokens: None,
            pricing: ModelPricing::default(),
        }
    }
}

impl ModelConfig {
    /// Builds the provider adapter, reading the key from `api_key_env`.
    pub fn build_model(&self) -> Result<Arc<dyn ChatModel>, ConfigError> {
        let api_key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingApiKey(self.api_key_env.clone()))?;
        self.build_model_with_key(api_key)
    }

    pub fn build_model_with_key(
        &self,
        api_key: impl Into<String>,
    ) -> Result<Arc<dyn ChatModel>, ConfigError> {
        let model: Arc<dyn ChatModel> = match self.provider {
            ModelProvider::Openai => {
                let mut config = OpenAiCompatModelConfig::new(api_key, self.model.clone());
                config.api_base_url = self.api_base.clone();
                config.pricing = self.pricing;
                if self.max_tokens.is_some() {
                    config.max_tokens = self.max_tokens;
                }
                Arc::new(OpenAiCompatModel::new(config)?)
            }
            ModelProvider::Anthropic => {
                let mut config = AnthropicModelConfig::new(api_key, self.model.clone());
                config.api_base_url = self.api_base.clone();
                config.pricing = self.pricing;
                if let Some(max_tokens) = self.max_tokens {
                    config.max_tokens = max_tokens;
                }
                Arc::new(AnthropicModel::new(config)?)
            }
        };
        Ok(model)
    }
}

/// Model-call retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per model call, including the first (default: 6).
    pub max_attempts: u32,
    /// First backoff delay in milliseconds (default: 3000).
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default: 60000).
    pub max_delay_ms: u64,
    /// Backoff growth factor (default: 2.0).
    pub multiplier: f64,
    /// Per-call timeout in seconds (default: 120).
    pub call_timeout_secs: u64,
    /// Consecutive failures that open the circuit breaker (default: 12).
    pub breaker_threshold: u32,
    /// How long the breaker stays open, in seconds (default: 60).
    pub breaker_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay_ms: 3000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            call_timeout_secs: 120,
            breaker_threshold: 12,
            breaker_cooldown_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            breaker_threshold: self.breaker_threshold,
            breaker_cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }
}

/// Agent loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Turn budget per episode (default: 30).
    pub max_turns: u32,
    /// Operating instructions placed before the domain rules.
    pub instruction: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 30,
            instruction: DEFAULT_INSTRUCTION.into(),
        }
    }
}

impl AgentSettings {
    pub fn to_agent_config(&self, temperature: f32) -> AgentConfig {
        AgentConfig {
            instruction: self.instruction.clone(),
            max_turns: self.max_turns,
            temperature,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    #[default]
    ExecutionMatch,
    ExactAnswer,
}

/// Environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// JSON array of tasks.
    pub tasks_path: String,
    /// Plain-text domain rules appended to the system turn.
    pub rules_path: Option<String>,
    /// SQLite URL, opened read-only.
    pub database_url: String,
    /// Rows shown per query observation (default: 50).
    pub max_rows: usize,
    /// Clarifying questions allowed per task (default: 3).
    pub max_clarifications: usize,
    pub scorer: ScorerKind,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            tasks_path: "data/tasks.json".into(),
            rules_path: None,
            database_url: "sqlite://data/ehr.sqlite".into(),
            max_rows: 50,
            max_clarifications: 3,
            scorer: ScorerKind::ExecutionMatch,
        }
    }
}
