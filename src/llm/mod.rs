mod anthropic;
mod openai;
mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

pub use anthropic::{AnthropicModel, AnthropicModelConfig};
pub use openai::{OpenAiCompatModel, OpenAiCompatModelConfig};
pub use retry::{ModelClient, RetryPolicy};

/// One conversation turn. The history of an episode is an append-only
/// sequence of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ModelMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ModelToolCall>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

impl ModelMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A capability as advertised to the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A raw assistant turn as returned by a provider.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCompletion {
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
    pub usage: Option<ModelUsage>,
    /// Provider-billed cost in USD, when known.
    pub cost: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// USD per million tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn cost(&self, usage: &ModelUsage) -> f64 {
        f64::from(usage.input_tokens) * self.input_per_million / 1_000_000.0
            + f64::from(usage.output_tokens) * self.output_per_million / 1_000_000.0
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        temperature: f32,
    ) -> Result<ModelCompletion, ProviderError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn pricing_scales_per_million_tokens() {
        let pricing = ModelPricing {
            input_per_million: 2.5,
            output_per_million: 10.0,
        };
        let cost = pricing.cost(&ModelUsage {
            input_tokens: 1_000,
            output_tokens: 200,
        });
        assert!((cost - 0.0045).abs() < 1e-12);
    }

    #[test]
    fn messages_serialize_with_role_tag() {
        let value = serde_json::to_value(ModelMessage::ToolResult {
            tool_call_id: "call_1".to_string(),
            tool_name: "list_tables".to_string(),
            content: "patients".to_string(),
        })
        .expect("serializes");

        assert_eq!(value["role"], "tool_result");
        assert_eq!(value["tool_call_id"], "call_1");

        let assistant = serde_json::to_value(ModelMessage::Assistant {
            content: Some("done".to_string()),
            tool_calls: vec![],
        })
        .expect("serializes");
        assert_eq!(assistant, json!({"role": "assistant", "content": "done"}));
    }
}
