//! Error types for the daemon, the worker pool, and the chat loop.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error. Domain errors convert into this at module boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures surfaced by the worker pool to job submitters.
///
/// Semantic query failures are not here: those come back inline on the
/// `ExecutionResult` so a failed SQL tool call stays scoped to that one
/// execution instead of failing the whole turn.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// The worker process died mid-job twice (the job is requeued once after
    /// the first crash).
    #[error("worker crashed while executing the query")]
    WorkerCrash,

    /// The job exceeded its deadline; the worker was killed and replaced.
    #[error("query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    /// A worker process could not be spawned after retries.
    #[error("failed to spawn query worker: {0}")]
    SpawnFailed(String),

    /// The pool is shutting down and no longer accepts jobs.
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// LLM provider plumbing failures.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no API key configured for provider '{0}'")]
    MissingProviderKey(String),

    #[error("unknown LLM provider '{0}'")]
    UnknownProvider(String),

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider stream ended unexpectedly: {0}")]
    StreamInterrupted(String),
}

/// Database connection and migration failures.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Configuration loading/validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
