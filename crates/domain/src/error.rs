/// Shared error type used across all tiller crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template: {0}")]
    Template(String),

    #[error("path escapes workspace: {0}")]
    PathEscape(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("model: {0}")]
    Model(String),

    #[error("interceptor {name}: {message}")]
    Interceptor { name: String, message: String },

    #[error("LLM call limit exceeded ({0} calls)")]
    LimitExceeded(usize),

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
