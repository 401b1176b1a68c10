use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EnvError;

/// One evaluation item. The gold fields stay on the environment side and
/// are never shown to the model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: Option<String>,
    /// The user's opening request.
    #[serde(alias = "question")]
    pub instruction: String,
    #[serde(default, alias = "query")]
    pub gold_sql: Option<String>,
    #[serde(default)]
    pub gold_answer: Option<String>,
    /// Details revealed only when the agent asks the user.
    #[serde(default)]
    pub clarification: Option<String>,
}

impl Task {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Self::default()
        }
    }

    /// The explicit id, or the position in the task set.
    pub fn id_or_index(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| index.to_string())
    }
}

/// A fixed, ordered collection of tasks addressed by index.
#[derive(Clone, Debug, Default)]
pub struct TaskSet {
    tasks: Vec<Arc<Task>>,
}

impl TaskSet {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(Arc::new).collect(),
        }
    }

    /// Reads a JSON array of tasks.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EnvError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EnvError::TaskSource(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, EnvError> {
        let tasks = serde_json::from_str::<Vec<Task>>(raw)
            .map_err(|err| EnvError::TaskSource(err.to_string()))?;
        Ok(Self::new(tasks))
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Task>> {
        self.tasks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
