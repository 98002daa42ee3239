//! Error types for the stdio gateway bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server process error: {0}")]
    ServerProcess(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("HTTP server error: {0}")]
    HttpServer(String),

    #[error("Unknown or expired session: {0}")]
    UnknownSession(String),

    #[error("Bridge is shutting down, no new sessions accepted")]
    ShuttingDown,

    #[error("Downstream sink closed")]
    SinkClosed,

    #[error("Downstream sink write exceeded {0:?}")]
    SinkTimeout(std::time::Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
