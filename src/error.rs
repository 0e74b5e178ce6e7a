//! Error types for stemrelay.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    // Inbound message errors
    #[error("{message}")]
    MalformedInput { message: String },

    #[error("Malformed audio: {message}")]
    MalformedAudio { message: String },

    #[error("No engine configured")]
    NoEngineConfigured,

    // Separation engine errors
    #[error("Failed to configure engine '{model}': {message}")]
    EngineConfig { model: String, message: String },

    #[error("Separation failed: {message}")]
    EngineRuntime { message: String },

    #[error("Processing backlog full ({capacity} windows queued), window dropped")]
    QueueFull { capacity: usize },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Shorthand for a malformed-audio error.
    pub fn malformed_audio(message: impl Into<String>) -> Self {
        RelayError::MalformedAudio {
            message: message.into(),
        }
    }

    /// Shorthand for an engine runtime error.
    pub fn engine_runtime(message: impl Into<String>) -> Self {
        RelayError::EngineRuntime {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
