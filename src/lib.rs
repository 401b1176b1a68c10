//! Evaluation harness for SQL-writing language-model agents.
//!
//! Surface:
//! - `Environment` with `reset`/`step` over a task set, a capability
//!   catalogue and a scorer
//! - `Agent` loop with `run` and `run_stream` entry points
//! - `ModelClient` retry layer with backoff, per-call timeout and circuit breaker
//! - OpenAI-compatible and Anthropic adapters
//! - SQLite-backed capabilities plus a clarification capability

pub mod action;
pub mod agent;
pub mod capability;
pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod llm;

pub use action::{Action, Invocation, decode_action};
pub use agent::{Agent, AgentBuilder, AgentConfig, AgentEvent, RunResult, run, run_stream};
pub use capability::{Capability, InvocationContext};
pub use env::{
    EnvReset, EnvState, EnvStepResult, Environment, EnvironmentBuilder, Info, Scorer, Task,
    TaskSet,
};
pub use error::{AgentError, CapabilityError, ConfigError, EnvError, ProviderError, SchemaError};
pub use llm::{
    AnthropicModel, AnthropicModelConfig, ChatModel, ModelClient, ModelCompletion, ModelMessage,
    ModelToolCall, ModelToolDefinition, OpenAiCompatModel, OpenAiCompatModelConfig, RetryPolicy,
};
