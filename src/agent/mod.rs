use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::action::{Action, decode_action};
use crate::env::{Environment, Info};
use crate::error::AgentError;
use crate::llm::{ChatModel, ModelClient, ModelMessage, RetryPolicy};

pub const OUTCOME_ANSWERED: &str = "answered";
pub const OUTCOME_TURN_BUDGET_EXHAUSTED: &str = "turn_budget_exhausted";
pub const OUTCOME_ABORTED: &str = "aborted";

pub const DEFAULT_INSTRUCTION: &str = "\
You are a SQL agent working against an electronic health records database. \
Turn the user's request about patient data into one SQL query that returns exactly the records asked for.

1. Clarify: if the request is ambiguous (which lab test, which code set, what date range), \
ask the user one question with `ask_user` before going further.
2. Explore: use `list_tables`, `table_schema` and `search_values` to confirm table names, \
column names and the exact values you filter on. Try candidate queries with `run_query`.
3. Make only one capability call per response, then wait for its result.
4. Never guess a table, column or code. Confirm it with a capability or with the user.
5. Finish by replying with a single line `SQL_QUERY: <statement>` holding one complete \
read-only statement and no other commentary.
";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Operating instructions; the environment's rules are appended.
    pub instruction: String,
    pub max_turns: u32,
    pub temperature: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instruction: DEFAULT_INSTRUCTION.to_string(),
            max_turns: 30,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    Invoke {
        capability: String,
        arguments: Value,
        call_id: String,
    },
    Observation {
        content: String,
        reward: f64,
        done: bool,
    },
    Finished {
        result: RunResult,
    },
}

/// Terminal artifact of one episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub reward: f64,
    pub messages: Vec<ModelMessage>,
    pub cost: f64,
    pub info: Info,
}

impl RunResult {
    /// True when the turn budget ran out before the environment finished.
    pub fn timed_out(&self) -> bool {
        self.info.get("outcome").and_then(Value::as_str) == Some(OUTCOME_TURN_BUDGET_EXHAUSTED)
    }

    /// Zero-reward record for an episode that ended with an error.
    pub fn aborted(error: &AgentError) -> Self {
        let mut info = Info::new();
        info.insert("done".to_string(), json!(false));
        info.insert("outcome".to_string(), json!(OUTCOME_ABORTED));
        info.insert("error".to_string(), json!(error.to_string()));
        Self {
            reward: 0.0,
            messages: Vec::new(),
            cost: 0.0,
            info,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.info.get("outcome").and_then(Value::as_str) == Some(OUTCOME_ABORTED)
    }
}

pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    retry_policy: RetryPolicy,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            model: None,
            retry_policy: RetryPolicy::default(),
            config: AgentConfig::default(),
        }
    }
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn shared_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.instruction = instruction.into();
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.config.max_turns = max_turns;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = temperature;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };
        if self.config.max_turns == 0 {
            return Err(AgentError::Config("max_turns must be at least 1".to_string()));
        }

        Ok(Agent {
            client: ModelClient::new(model, self.retry_policy),
            config: self.config,
        })
    }
}

/// Drives episodes against an [`Environment`]. Holds no per-episode state,
/// so one agent can run many episodes in sequence.
pub struct Agent {
    client: ModelClient,
    config: AgentConfig,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn run(
        &self,
        env: &mut Environment,
        task_index: usize,
    ) -> Result<RunResult, AgentError> {
        let stream = self.run_stream(env, task_index);
        futures_util::pin_mut!(stream);

        let mut run_result: Option<RunResult> = None;

        while let Some(event) = stream.next().await {
            match event? {
                AgentEvent::Finished { result } => run_result = Some(result),
                AgentEvent::Thinking { .. }
                | AgentEvent::Text { .. }
                | AgentEvent::Invoke { .. }
                | AgentEvent::Observation { .. } => {}
            }
        }

        run_result.ok_or(AgentError::MissingRunResult)
    }

    pub fn run_stream<'a>(
        &'a self,
        env: &'a mut Environment,
        task_index: usize,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + 'a {
        try_stream! {
            let reset = env.reset(task_index)?;
            let tools = env.capability_definitions().to_vec();
            let mut messages = vec![
                ModelMessage::system(self.system_prompt(env.rules())),
                ModelMessage::user(reset.observation),
            ];
            let mut run_info = reset.info;
            let mut reward = 0.0;
            let mut cost = 0.0;
            let mut done = false;
            let mut turns = 0;

            info!(task_index, max_turns = self.config.max_turns, "episode started");

            while turns < self.config.max_turns {
                turns += 1;

                let (completion, call_cost) = self
                    .client
                    .complete(&messages, &tools, self.config.temperature)
                    .await?;
                cost += call_cost;

                if let Some(thinking) = completion.thinking.clone() {
                    yield AgentEvent::Thinking { content: thinking };
                }
                if let Some(text) = completion.text.clone() {
                    if !text.is_empty() {
                        yield AgentEvent::Text { content: text };
                    }
                }

                let mut action = decode_action(&completion);
                if let Action::Invoke(invocation) = &mut action {
                    if invocation.call_id.trim().is_empty() {
                        invocation.call_id = format!("call_{turns}");
                    }
                    yield AgentEvent::Invoke {
                        capability: invocation.capability.clone(),
                        arguments: invocation.arguments.clone(),
                        call_id: invocation.call_id.clone(),
                    };
                }
                debug!(turn = turns, respond = action.is_respond(), "stepping environment");

                let step = env.step(&action).await?;
                run_info.extend(step.info);
                reward = step.reward;
                done = step.done;

                match &action {
                    Action::Invoke(invocation) => {
                        messages.push(ModelMessage::Assistant {
                            content: completion.text.clone(),
                            tool_calls: vec![invocation.to_tool_call()],
                        });
                        messages.push(ModelMessage::ToolResult {
                            tool_call_id: invocation.call_id.clone(),
                            tool_name: invocation.capability.clone(),
                            content: step.observation.clone(),
                        });
                    }
                    Action::Respond { text } => {
                        messages.push(ModelMessage::Assistant {
                            content: Some(text.clone()),
                            tool_calls: Vec::new(),
                        });
                        if !step.done {
                            messages.push(ModelMessage::user(step.observation.clone()));
                        }
                    }
                }

                yield AgentEvent::Observation {
                    content: step.observation,
                    reward: step.reward,
                    done: step.done,
                };

                if done {
                    break;
                }
            }

            let outcome = if done {
                OUTCOME_ANSWERED
            } else {
                OUTCOME_TURN_BUDGET_EXHAUSTED
            };
            run_info.insert("done".to_string(), json!(done));
            run_info.insert("turns".to_string(), json!(turns));
            run_info.insert("outcome".to_string(), json!(outcome));

            let result = RunResult {
                reward,
                messages,
                cost: round_cost(cost),
                info: run_info,
            };
            info!(
                task_index,
                reward,
                turns,
                outcome,
                cost = result.cost,
                "episode finished"
            );

            yield AgentEvent::Finished { result };
        }
    }

    fn system_prompt(&self, rules: &str) -> String {
        format!("{}\nRules:\n{rules}", self.config.instruction)
    }
}

fn round_cost(cost: f64) -> f64 {
    (cost * 1e8).round() / 1e8
}

pub async fn run(
    agent: &Agent,
    env: &mut Environment,
    task_index: usize,
) -> Result<RunResult, AgentError> {
    agent.run(env, task_index).await
}

pub fn run_stream<'a>(
    agent: &'a Agent,
    env: &'a mut Environment,
    task_index: usize,
) -> impl Stream<Item = Result<AgentEvent, AgentError>> + 'a {
    agent.run_stream(env, task_index)
}
