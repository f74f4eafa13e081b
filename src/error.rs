use std::fmt;
use thiserror::Error;

/// Rule of the SQL gate that rejected a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    EmptyStatement,
    DeniedKeyword(&'static str),
    NotSelect,
    MultipleStatements,
    InvalidTenant,
    MissingTenantScope,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationRule::EmptyStatement => write!(f, "statement is empty"),
            ValidationRule::DeniedKeyword(kw) => write!(f, "keyword {} is not allowed", kw),
            ValidationRule::NotSelect => write!(f, "only SELECT statements are allowed"),
            ValidationRule::MultipleStatements => write!(f, "only a single statement is allowed"),
            ValidationRule::InvalidTenant => write!(f, "tenant identifier is malformed"),
            ValidationRule::MissingTenantScope => {
                write!(f, "statement is not scoped to the caller's tenant")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Prompt error: {0}")]
    Prompt(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("SQL validation error: {0}")]
    SqlValidation(ValidationRule),

    #[error("SQL execution error: {0}")]
    SqlExecution(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NlqError {
    /// Stable identifier used in `error` events and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            NlqError::Configuration(_) => "configuration",
            NlqError::InvalidRequest(_) => "invalid_request",
            NlqError::Prompt(_) => "prompt",
            NlqError::Generation(_) => "generation",
            NlqError::SqlValidation(_) => "sql_validation",
            NlqError::SqlExecution(_) => "sql_execution",
            NlqError::Analysis(_) => "analysis",
            NlqError::Database(_) => "database",
            NlqError::Io(_) => "io",
            NlqError::Json(_) => "json",
        }
    }
}

impl From<sqlx::Error> for NlqError {
    fn from(err: sqlx::Error) -> Self {
        NlqError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NlqError>;
