use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("capability schema must be a JSON object")]
    SchemaNotObject,
    #[error("capability schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

/// Failure inside a capability. Never raised past the environment: it is
/// rendered into the observation the model sees.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("invalid arguments for {capability}: {message}")]
    InvalidArguments { capability: String, message: String },
    #[error("{0}")]
    Execution(String),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("only a single read-only statement (SELECT, WITH, EXPLAIN, PRAGMA) may be executed")]
    NotReadOnly,
    #[error("table not found: {0}")]
    UnknownTable(String),
    #[error("column not found: {table}.{column}")]
    UnknownColumn { table: String, column: String },
}

impl From<DbError> for CapabilityError {
    fn from(err: DbError) -> Self {
        Self::Execution(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider call timed out after {0} ms")]
    Timeout(u64),
    #[error("provider rate limited the request: {0}")]
    RateLimited(String),
    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provider response invalid: {0}")]
    Response(String),
}

impl ProviderError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("task index {index} out of range (task set has {len} tasks)")]
    TaskNotFound { index: usize, len: usize },
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
    #[error("environment has no active task; call reset first")]
    NotStarted,
    #[error("episode already finished; call reset to start a new task")]
    EpisodeFinished,
    #[error("scoring failed: {0}")]
    Scoring(String),
    #[error("task source error: {0}")]
    TaskSource(String),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("environment configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("model call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },
    #[error("model circuit breaker open; retry in {retry_in_ms} ms")]
    CircuitOpen { retry_in_ms: u64 },
    #[error("agent stream ended without a run result")]
    MissingRunResult,
    #[error("agent configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} is not set")]
    MissingApiKey(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
