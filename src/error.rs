use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    #[error("Tokio join error: {0}")]
    Join(#[from] JoinError),

    #[error("Worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Persist error: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Generic error: {0}")]
    Generic(String),
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({
                "error": self.to_string(),
            }))
    }

    fn status_code(&self) -> StatusCode {
        match *self {
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Walkdir(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ThreadPool(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Configuration(_) => StatusCode::BAD_REQUEST,
            AppError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
