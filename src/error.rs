use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FerryError {
    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    #[error("No persistence peer found in directory")]
    NoPersistencePeer,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport is stopped")]
    TransportStopped,

    #[error("JSON error: {0}")]
    Json(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FerryError>;

impl From<std::io::Error> for FerryError {
    fn from(e: std::io::Error) -> Self {
        FerryError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(e: serde_json::Error) -> Self {
        FerryError::Json(e.to_string())
    }
}

impl FerryError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FerryError::Transport(_) | FerryError::NoPersistencePeer | FerryError::Io(_)
        )
    }
}
