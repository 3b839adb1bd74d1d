use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fragment store error: {0}")]
    Store(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Access scope error: {0}")]
    Scope(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, QueryError>;
