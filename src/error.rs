use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CurateError {
    #[error("candidate sequence {base_name} has {count} member(s), at least 2 required")]
    InvalidCandidate { base_name: String, count: usize },

    #[error("no readable images in candidate sequence {0}")]
    NoValidImages(String),

    #[error("scan root does not exist or is not a directory: {0}")]
    ScanRoot(PathBuf),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing API key: pass --api-key or set GEMINI_API_KEY")]
    #[diagnostic(help("GOOGLE_AI_API_KEY is accepted as well"))]
    MissingApiKey,

    #[error("classification request failed: {0}")]
    ServiceHttp(String),

    #[error("classification service returned status {status}: {message}")]
    ServiceStatus { status: u16, message: String },

    #[error("unexpected classification service payload: {0}")]
    ServiceResponse(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Store(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(PathBuf),

    #[error("series not found: {0}")]
    SeriesNotFound(i64),

    #[error("no series with base name {0}")]
    SeriesNameNotFound(String),

    #[error("image reference not found: {0}")]
    ImageReferenceNotFound(i64),

    #[error("failed to serialize classification: {0}")]
    Serialization(String),

    #[error("terminal error: {0}")]
    Terminal(String),
}

impl From<rusqlite::Error> for CurateError {
    fn from(err: rusqlite::Error) -> Self {
        CurateError::Store(err.to_string())
    }
}
