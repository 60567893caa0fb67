use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Invalid session transition: {from} -> {action}")]
    Transition { from: String, action: String },

    #[error("No active session")]
    NoActiveSession,

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
