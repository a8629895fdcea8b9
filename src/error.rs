use thiserror::Error;

/// Fatal pipeline failures. Row-local cleansing problems are *not* errors of
/// this type; they travel as [`BadValue`] records on the `process_errors`
/// channel while processing continues.
#[derive(Debug, Error)]
pub enum PipeError {
    /// A configuration problem: malformed argument, missing lookup, unknown
    /// operator. Aborts the node and is never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The node's cancellation token fired while this task was blocked.
    #[error("interrupted by cancellation")]
    Interrupted,

    /// A downstream channel disappeared before this producer was done.
    #[error("channel '{0}' closed before end of input")]
    ChannelClosed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("{0}")]
    System(String),
}

impl PipeError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipeError::Config(msg.into())
    }

    pub fn system(msg: impl Into<String>) -> Self {
        PipeError::System(msg.into())
    }

    /// True when the failure must land in `failure_details` without retry.
    pub fn is_config(&self) -> bool {
        matches!(self, PipeError::Config(_))
    }
}

/// A row-local validation failure produced by a cleansing function.
/// The offending row is emitted on the `process_errors` channel and the
/// pipeline keeps going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadValue(pub String);

impl std::fmt::Display for BadValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl BadValue {
    pub fn new(msg: impl Into<String>) -> Self {
        BadValue(msg.into())
    }
}

pub type PipeResult<T> = Result<T, PipeError>;
