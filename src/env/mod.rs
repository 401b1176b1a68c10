mod scoring;
mod task;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::capability::clarify::ask_user;
use crate::capability::sql::sql_capabilities;
use crate::capability::{Capability, InvocationContext};
use crate::config::{EnvConfig, ScorerKind};
use crate::db::SqlDatabase;
use crate::error::EnvError;
use crate::llm::ModelToolDefinition;

pub use scoring::{
    ExactAnswerScorer, ExecutionMatchScorer, Score, Scorer, extract_sql, final_answer,
};
pub use task::{Task, TaskSet};

/// Diagnostic key/value mapping attached to resets, steps and run results.
pub type Info = Map<String, Value>;

const ANSWER_RECORDED: &str = "Thank you. Your answer has been recorded.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvState {
    Uninitialized,
    Active,
    Terminated,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnvReset {
    pub observation: String,
    pub info: Info,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnvStepResult {
    pub observation: String,
    pub reward: f64,
    pub done: bool,
    pub info: Info,
}

struct Episode {
    task_index: usize,
    task: Arc<Task>,
    reward: f64,
    transcript: Vec<Action>,
    capability_calls: usize,
}

/// Stateful adjudicator of one task episode at a time.
pub struct Environment {
    tasks: TaskSet,
    rules: String,
    capabilities: Vec<Capability>,
    capability_index: HashMap<String, usize>,
    definitions: Vec<ModelToolDefinition>,
    scorer: Arc<dyn Scorer>,
    state: EnvState,
    episode: Option<Episode>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("tasks", &self.tasks.len())
            .field("capabilities", &self.capability_index.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// Opens the database, loads tasks and rules, and registers the
    /// built-in capabilities.
    pub async fn from_config(config: &EnvConfig) -> Result<Self, EnvError> {
        let tasks = TaskSet::load(&config.tasks_path)?;
        let rules = match &config.rules_path {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|err| EnvError::Config(format!("failed to read rules {path}: {err}")))?,
            None => String::new(),
        };

        let db = SqlDatabase::connect(&config.database_url).await?;
        let mut capabilities = sql_capabilities(&db, config.max_rows)
            .map_err(|err| EnvError::Config(err.to_string()))?;
        capabilities.push(
            ask_user(config.max_clarifications).map_err(|err| EnvError::Config(err.to_string()))?,
        );

        let builder = Self::builder()
            .tasks(tasks)
            .rules(rules)
            .capabilities(capabilities);
        let builder = match config.scorer {
            ScorerKind::ExecutionMatch => builder.scorer(ExecutionMatchScorer::new(db)),
            ScorerKind::ExactAnswer => builder.scorer(ExactAnswerScorer),
        };
        builder.build()
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    /// Domain rules appended to the agent's operating instructions.
    pub fn rules(&self) -> &str {
        &self.rules
    }

    /// The capability catalogue, fixed at construction.
    pub fn capability_definitions(&self) -> &[ModelToolDefinition] {
        &self.definitions
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Starts a new episode on the task at `task_index`, replacing any
    /// previous one.
    pub fn reset(&mut self, task_index: usize) -> Result<EnvReset, EnvError> {
        let task = self
            .tasks
            .get(task_index)
            .cloned()
            .ok_or(EnvError::TaskNotFound {
                index: task_index,
                len: self.tasks.len(),
            })?;

        for capability in &self.capabilities {
            capability.reset();
        }

        let task_id = task.id_or_index(task_index);
        let mut info = Info::new();
        info.insert("task_index".to_string(), json!(task_index));
        info.insert("task_id".to_string(), json!(task_id));
        if let Some(gold_sql) = &task.gold_sql {
            info.insert("gold_sql".to_string(), json!(gold_sql));
        }
        if let Some(gold_answer) = &task.gold_answer {
            info.insert("gold_answer".to_string(), json!(gold_answer));
        }

        let observation = task.instruction.clone();
        self.episode = Some(Episode {
            task_index,
            task,
            reward: 0.0,
            transcript: Vec::new(),
            capability_calls: 0,
        });
        self.state = EnvState::Active;
        info!(task_index, task_id = %task_id, "environment reset");

        Ok(EnvReset { observation, info })
    }

    pub async fn step(&mut self, action: &Action) -> Result<EnvStepResult, EnvError> {
        match self.state {
            EnvState::Uninitialized => return Err(EnvError::NotStarted),
            EnvState::Terminated => return Err(EnvError::EpisodeFinished),
            EnvState::Active => {}
        }
        let Some(episode) = self.episode.as_mut() else {
            return Err(EnvError::NotStarted);
        };

        match action {
            Action::Invoke(invocation) => {
                let capability = self
                    .capability_index
                    .get(&invocation.capability)
                    .map(|&index| &self.capabilities[index])
                    .ok_or_else(|| EnvError::UnknownCapability(invocation.capability.clone()))?;

                let ctx = InvocationContext {
                    task_index: episode.task_index,
                    task: episode.task.clone(),
                };
                let observation = match capability.invoke(invocation.arguments.clone(), ctx).await {
                    Ok(observation) => observation,
                    Err(err) => {
                        warn!(capability = %invocation.capability, error = %err, "capability failed");
                        format!("Error: {err}")
                    }
                };

                episode.capability_calls += 1;
                episode.transcript.push(action.clone());
                debug!(
                    capability = %invocation.capability,
                    calls = episode.capability_calls,
                    "capability invoked"
                );

                let mut info = Info::new();
                info.insert("capability_calls".to_string(), json!(episode.capability_calls));
                Ok(EnvStepResult {
                    observation,
                    reward: episode.reward,
                    done: false,
                    info,
                })
            }
            Action::Respond { text } => {
                episode.transcript.push(action.clone());
                let score = match self.scorer.score(&episode.task, &episode.transcript).await {
                    Ok(score) => score,
                    Err(err) => {
                        episode.transcript.pop();
                        return Err(err);
                    }
                };

                episode.reward = score.reward;
                let done = score.follow_up.is_none();
                if done {
                    self.state = EnvState::Terminated;
                }
                info!(
                    task_index = episode.task_index,
                    reward = score.reward,
                    done,
                    "episode scored"
                );

                let mut info = score.info;
                info.insert("answer".to_string(), json!(text));
                Ok(EnvStepResult {
                    observation: score
                        .follow_up
                        .unwrap_or_else(|| ANSWER_RECORDED.to_string()),
                    reward: score.reward,
                    done,
                    info,
                })
            }
        }
    }
}

#[derive(Default)]
pub struct EnvironmentBuilder {
    tasks: TaskSet,
    rules: String,
    capabilities: Vec<Capability>,
    scorer: Option<Arc<dyn Scorer>>,
}

impl EnvironmentBuilder {
    pub fn tasks(mut self, tasks: TaskSet) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn rules(mut self, rules: impl Into<String>) -> Self {
        self.rules = rules.into();
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn capabilities<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn scorer<S>(mut self, scorer: S) -> Self
    where
        S: Scorer + 'static,
    {
        self.scorer = Some(Arc::new(scorer));
        self
    }

    pub fn build(self) -> Result<Environment, EnvError> {
        let scorer = self
            .scorer
            .ok_or_else(|| EnvError::Config("a scorer is required".to_string()))?;

        let mut capability_index = HashMap::with_capacity(self.capabilities.len());
        for (index, capability) in self.capabilities.iter().enumerate() {
            if capability_index
                .insert(capability.name().to_string(), index)
                .is_some()
            {
                return Err(EnvError::Config(format!(
                    "duplicate capability name: {}",
                    capability.name()
                )));
            }
        }
        let definitions = self.capabilities.iter().map(Capability::definition).collect();

        Ok(Environment {
            tasks: self.tasks,
            rules: self.rules,
            capabilities: self.capabilities,
            capability_index,
            definitions,
            scorer,
            state: EnvState::Uninitialized,
            episode: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::action::Invocation;
    use crate::capability::string_arg;
    use crate::error::CapabilityError;

    fn tasks() -> TaskSet {
        let mut first = Task::new("How many patients are female?");
        first.id = Some("ehr-0".to_string());
        first.gold_answer = Some("2".to_string());
        let mut second = Task::new("What is the oldest anchor age?");
        second.gold_sql = Some("SELECT MAX(anchor_age) FROM patients".to_string());
        TaskSet::new(vec![first, second])
    }

    fn lookup() -> Capability {
        Capability::new("lookup", "look a word up")
            .with_schema(json!({
                "type": "object",
                "properties": {"word": {"type": "string"}},
                "required": ["word"]
            }))
            .expect("schema valid")
            .with_handler(|args, ctx| async move {
                let word = string_arg("lookup", &args, "word")?;
                if word == "boom" {
                    return Err(CapabilityError::Execution("lookup backend down".to_string()));
                }
                Ok(format!("{word} (task {})", ctx.task_index))
            })
    }

    fn environment() -> Environment {
        Environment::builder()
            .tasks(tasks())
            .rules("Use anchor_age for ages.")
            .capability(lookup())
            .scorer(ExactAnswerScorer)
            .build()
            .expect("environment builds")
    }

    fn invoke(capability: &str, arguments: Value) -> Action {
        Action::Invoke(Invocation {
            call_id: "call_1".to_string(),
            capability: capability.to_string(),
            arguments,
        })
    }

    fn respond(text: &str) -> Action {
        Action::Respond {
            text: text.to_string(),
        }
    }

    #[test]
    fn reset_exposes_instruction_and_task_metadata() {
        let mut env = environment();
        assert_eq!(env.state(), EnvState::Uninitialized);

        let reset = env.reset(0).expect("reset");
        assert_eq!(reset.observation, "How many patients are female?");
        assert_eq!(reset.info["task_id"], json!("ehr-0"));
        assert_eq!(reset.info["gold_answer"], json!("2"));
        assert!(!reset.info.contains_key("gold_sql"));
        assert_eq!(env.state(), EnvState::Active);

        let reset = env.reset(1).expect("reset");
        assert_eq!(reset.info["task_id"], json!("1"));
        assert_eq!(reset.info["gold_sql"], json!("SELECT MAX(anchor_age) FROM patients"));
    }

    #[test]
    fn reset_is_idempotent_and_rejects_out_of_range() {
        let mut env = environment();
        let first = env.reset(0).expect("reset");
        let second = env.reset(0).expect("reset");
        assert_eq!(first, second);

        let err = env.reset(7).expect_err("out of range");
        assert!(matches!(err, EnvError::TaskNotFound { index: 7, len: 2 }));
    }

    #[test]
    fn reset_runs_capability_reset_hooks() {
        let resets = Arc::new(AtomicUsize::new(0));
        let counter = resets.clone();
        let mut env = Environment::builder()
            .tasks(tasks())
            .capability(Capability::new("cached", "per-task cache").with_reset_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .scorer(ExactAnswerScorer)
            .build()
            .expect("environment builds");

        env.reset(0).expect("reset");
        env.reset(1).expect("reset");
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invoke_steps_never_finish_and_keep_reward() {
        let mut env = environment();
        env.reset(0).expect("reset");

        let first = env
            .step(&invoke("lookup", json!({"word": "gender"})))
            .await
            .expect("step");
        assert_eq!(first.observation, "gender (task 0)");
        assert_eq!(first.reward, 0.0);
        assert!(!first.done);
        assert_eq!(first.info["capability_calls"], json!(1));

        let second = env
            .step(&invoke("lookup", json!({"word": "age"})))
            .await
            .expect("step");
        assert_eq!(second.info["capability_calls"], json!(2));
        assert_eq!(env.state(), EnvState::Active);
    }

    #[tokio::test]
    async fn capability_failures_become_observations() {
        let mut env = environment();
        env.reset(0).expect("reset");

        let failed = env
            .step(&invoke("lookup", json!({"word": "boom"})))
            .await
            .expect("failure is data");
        assert_eq!(failed.observation, "Error: lookup backend down");
        assert!(!failed.done);

        let invalid = env
            .step(&invoke("lookup", json!({})))
            .await
            .expect("failure is data");
        assert!(invalid.observation.starts_with("Error: invalid arguments for lookup"));
    }

    #[tokio::test]
    async fn unknown_capability_is_fatal() {
        let mut env = environment();
        env.reset(0).expect("reset");

        let err = env
            .step(&invoke("drop_tables", json!({})))
            .await
            .expect_err("unknown capability");
        assert!(matches!(err, EnvError::UnknownCapability(name) if name == "drop_tables"));
        assert_eq!(env.state(), EnvState::Active);
    }

    #[tokio::test]
    async fn respond_scores_and_terminates() {
        let mut env = environment();
        env.reset(0).expect("reset");

        let result = env.step(&respond(" 2 ")).await.expect("step");
        assert!(result.done);
        assert_eq!(result.reward, 1.0);
        assert_eq!(result.observation, ANSWER_RECORDED);
        assert_eq!(result.info["answer"], json!(" 2 "));
        assert_eq!(result.info["exact_match"], json!(true));
        assert_eq!(env.state(), EnvState::Terminated);

        let err = env.step(&respond("again")).await.expect_err("finished");
        assert!(matches!(err, EnvError::EpisodeFinished));

        env.reset(0).expect("reset after termination");
        assert_eq!(env.state(), EnvState::Active);
    }

    #[tokio::test]
    async fn step_before_reset_is_rejected() {
        let mut env = environment();
        let err = env.step(&respond("hi")).await.expect_err("not started");
        assert!(matches!(err, EnvError::NotStarted));
    }

    #[tokio::test]
    async fn scoring_failure_leaves_episode_active() {
        let mut env = environment();
        env.reset(1).expect("reset");

        let err = env.step(&respond("99")).await.expect_err("no gold answer");
        assert!(matches!(err, EnvError::Scoring(_)));
        assert_eq!(env.state(), EnvState::Active);
    }

    /// Asks for a unit on the first answer, then scores the second.
    struct UnitPrompter;

    #[async_trait]
    impl Scorer for UnitPrompter {
        async fn score(&self, _task: &Task, transcript: &[Action]) -> Result<Score, EnvError> {
            let answers = transcript
                .iter()
                .filter(|action| matches!(action, Action::Respond { .. }))
                .count();
            Ok(Score {
                reward: if answers > 1 { 1.0 } else { 0.2 },
                info: Info::new(),
                follow_up: (answers == 1).then(|| "In which unit?".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn scorer_follow_up_keeps_episode_active() {
        let mut env = Environment::builder()
            .tasks(tasks())
            .scorer(UnitPrompter)
            .build()
            .expect("environment builds");
        env.reset(1).expect("reset");

        let first = env.step(&respond("91")).await.expect("step");
        assert!(!first.done);
        assert_eq!(first.observation, "In which unit?");
        assert_eq!(first.reward, 0.2);
        assert_eq!(env.state(), EnvState::Active);

        let second = env.step(&respond("91 years")).await.expect("step");
        assert!(second.done);
        assert_eq!(second.reward, 1.0);
        assert_eq!(second.observation, ANSWER_RECORDED);
        assert_eq!(env.state(), EnvState::Terminated);
    }

    #[test]
    fn builder_rejects_duplicates_and_missing_scorer() {
        let err = Environment::builder()
            .capability(lookup())
            .capability(lookup())
            .scorer(ExactAnswerScorer)
            .build()
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate capability name: lookup"));

        let err = Environment::builder().build().expect_err("no scorer");
        assert!(matches!(err, EnvError::Config(_)));
    }

    #[test]
    fn catalogue_is_exposed_unchanged() {
        let env = environment();
        let definitions = env.capability_definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0], lookup().definition());
        assert_eq!(env.rules(), "Use anchor_age for ages.");
    }
}
