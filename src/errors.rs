use thiserror::Error;

/// Errors raised by a store driver.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The relational backend failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The Redis backend failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Applying the schema migrations failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The referenced batch does not exist.
    #[error("batch {0} not found")]
    BatchNotFound(String),

    /// Jobs cannot be added to a batch that already completed.
    #[error("batch {0} has already finished")]
    BatchFinished(String),

    /// A stored record is missing fields or has malformed values.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors returned by [`QueueManager`](crate::QueueManager) operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No connection with this name was configured.
    #[error("unknown connection `{0}`")]
    UnknownConnection(String),

    /// The job payload could not be serialized.
    #[error("failed to serialize job payload: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A batch needs at least one job.
    #[error("cannot dispatch an empty batch")]
    EmptyBatch,

    /// The underlying driver failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A connection could not be built from its configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path of the file.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`Config`](crate::config::Config).
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is outside of its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A queue or the defaults reference a connection that is not defined.
    #[error("queue `{queue}` references unknown connection `{connection}`")]
    UnknownConnection {
        /// The referencing queue.
        queue: String,
        /// The missing connection.
        connection: String,
    },
}
