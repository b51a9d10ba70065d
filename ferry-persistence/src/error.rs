use ferry::FerryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Replay session registry is deactivated")]
    RegistryDeactivated,

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Ferry(#[from] FerryError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
