use thiserror::Error;

#[derive(Debug, Error)]
pub enum CouncilError {
    // Transport errors
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    // Control / review errors
    #[error("Control action failed: {action}: {message}")]
    Control { action: String, message: String },

    #[error("Review submission failed: {0}")]
    Review(String),

    #[error("No pending review request")]
    NoPendingReview,

    // API errors
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CouncilError>;
