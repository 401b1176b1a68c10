//! Scoring functions invoked on the terminal respond action.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::action::Action;
use crate::db::SqlDatabase;
use crate::env::{Info, Task};
use crate::error::EnvError;

const SQL_MARKER: &str = "SQL_QUERY:";

static CODE_FENCE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\n?(.*?)```"));

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Score {
    pub reward: f64,
    pub info: Info,
    /// When set, the episode stays active and this text is the next
    /// observation instead of the terminal acknowledgement.
    pub follow_up: Option<String>,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// Scores an episode given its ordered actions, the last of which is
    /// the respond being scored.
    async fn score(&self, task: &Task, transcript: &[Action]) -> Result<Score, EnvError>;
}

/// Text of the latest respond action in the transcript.
pub fn final_answer(transcript: &[Action]) -> Option<&str> {
    transcript.iter().rev().find_map(|action| match action {
        Action::Respond { text } => Some(text.as_str()),
        Action::Invoke(_) => None,
    })
}

/// Pulls the SQL statement out of an answer.
///
/// Takes the text after the last `SQL_QUERY:` marker, or else the last
/// fenced code block. Fences and a trailing semicolon are stripped.
pub fn extract_sql(answer: &str) -> Option<String> {
    let candidate = match answer.to_ascii_uppercase().rfind(SQL_MARKER) {
        Some(start) => {
            let tail = &answer[start + SQL_MARKER.len()..];
            first_fenced(tail).unwrap_or(tail)
        }
        None => last_fenced(answer)?,
    };

    let sql = candidate
        .trim()
        .trim_matches('`')
        .trim()
        .trim_end_matches(';')
        .trim();
    (!sql.is_empty()).then(|| sql.to_string())
}

fn first_fenced(text: &str) -> Option<&str> {
    let fence = CODE_FENCE.as_ref().ok()?;
    fence.captures(text)?.get(1).map(|body| body.as_str())
}

fn last_fenced(text: &str) -> Option<&str> {
    let fence = CODE_FENCE.as_ref().ok()?;
    fence.captures_iter(text).last()?.get(1).map(|body| body.as_str())
}

/// Rewards 1.0 when the answer equals the gold answer, ignoring case and
/// whitespace differences.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactAnswerScorer;

#[async_trait]
impl Scorer for ExactAnswerScorer {
    async fn score(&self, task: &Task, transcript: &[Action]) -> Result<Score, EnvError> {
        let gold = task
            .gold_answer
            .as_deref()
            .ok_or_else(|| EnvError::Scoring("task has no gold answer".to_string()))?;
        let answer = final_answer(transcript).unwrap_or_default();

        let matched = normalize_answer(answer) == normalize_answer(gold);
        let mut info = Info::new();
        info.insert("exact_match".to_string(), Value::Bool(matched));

        Ok(Score {
            reward: if matched { 1.0 } else { 0.0 },
            info,
            follow_up: None,
        })
    }
}

fn normalize_answer(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Rewards 1.0 when the answered SQL returns the same rows as the gold SQL,
/// compared as unordered multisets.
#[derive(Clone, Debug)]
pub struct ExecutionMatchScorer {
    db: SqlDatabase,
}

impl ExecutionMatchScorer {
    pub fn new(db: SqlDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Scorer for ExecutionMatchScorer {
    async fn score(&self, task: &Task, transcript: &[Action]) -> Result<Score, EnvError> {
        let gold_sql = task
            .gold_sql
            .as_deref()
            .ok_or_else(|| EnvError::Scoring("task has no gold SQL".to_string()))?;

        let mut info = Info::new();
        let Some(predicted) = final_answer(transcript).and_then(extract_sql) else {
            info.insert("predicted_sql".to_string(), Value::Null);
            info.insert("execution_match".to_string(), Value::Bool(false));
            info.insert(
                "prediction_error".to_string(),
                json!("no SQL query found in the answer"),
            );
            return Ok(Score {
                reward: 0.0,
                info,
                follow_up: None,
            });
        };
        info.insert("predicted_sql".to_string(), json!(predicted));

        let gold = self
            .db
            .query(gold_sql)
            .await
            .map_err(|err| EnvError::Scoring(format!("gold SQL failed: {err}")))?;

        let matched = match self.db.query(&predicted).await {
            Ok(result) => result.sorted_rows() == gold.sorted_rows(),
            Err(err) => {
                debug!(error = %err, "predicted SQL failed");
                info.insert("prediction_error".to_string(), json!(err.to_string()));
                false
            }
        };
        info.insert("execution_match".to_string(), Value::Bool(matched));

        Ok(Score {
            reward: if matched { 1.0 } else { 0.0 },
            info,
            follow_up: None,
        })
    }
}
