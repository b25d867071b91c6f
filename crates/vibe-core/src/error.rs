//! Unified error types for Vibe

use thiserror::Error;

/// Unified error type for all Vibe operations
#[derive(Error, Debug)]
pub enum VibeError {
    // Patch errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Application failed: {0}")]
    Application(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Missing pre-image for '{op}' at {path}: cannot construct inverse")]
    MissingPreImage { op: String, path: String },

    // Resource errors
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Pointer not found: {0}")]
    PointerNotFound(String),

    #[error("Invalid pointer: {0}")]
    InvalidPointer(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Test failed: {0}")]
    TestFailed(String),

    #[error("Path validation failed: {0}")]
    PathValidation(String),

    // Event log errors
    #[error("Event log error: {0}")]
    EventLog(String),

    // Hub errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using VibeError
pub type Result<T> = std::result::Result<T, VibeError>;
