// Cadre Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CadreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no suitable provider for {0}")]
    NoSuitableProvider(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CadreError>;
