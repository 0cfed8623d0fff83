use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Identity error: {0}")]
    Identity(String),
    #[error("Extraction error: {0}")]
    Extraction(String),
    #[error("Model error: {0}")]
    Model(String),
    #[error("Embedding backend unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Vector sink error: {0}")]
    Sink(String),
    #[error("Manifest error: {0}")]
    Manifest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

/// Coarse classification the orchestrator matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Identity,
    Extraction,
    Model,
    Sink,
    Manifest,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Identity => "identity",
            ErrorKind::Extraction => "extraction",
            ErrorKind::Model => "model",
            ErrorKind::Sink => "sink",
            ErrorKind::Manifest => "manifest",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Identity(_) => ErrorKind::Identity,
            AppError::Extraction(_) => ErrorKind::Extraction,
            AppError::Model(_) | AppError::ModelUnavailable(_) | AppError::OpenAI(_) => {
                ErrorKind::Model
            }
            AppError::Sink(_) | AppError::Database(_) => ErrorKind::Sink,
            AppError::Manifest(_) => ErrorKind::Manifest,
            AppError::Validation(_) | AppError::InvalidTransition(_) | AppError::Config(_) => {
                ErrorKind::Validation
            }
            AppError::ObjectStore(_)
            | AppError::Serialization(_)
            | AppError::NotFound(_)
            | AppError::Join(_)
            | AppError::Io(_)
            | AppError::Anyhow(_)
            | AppError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Errors that mean no further progress can be made for any file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::ModelUnavailable(_) | AppError::Manifest(_))
    }
}
