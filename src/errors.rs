use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error types for the Glow-TTS training loop
#[derive(Error, Debug)]
pub enum TrainError {
    /// IO errors that occur during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Module records could not be encoded for inspection
    #[error("Record encoding error: {0}")]
    RecordEncode(#[from] rmp_serde::encode::Error),

    /// Stored module records could not be read
    #[error("Record decoding error: {0}")]
    RecordDecode(#[from] rmp_serde::decode::Error),

    /// WAV writing errors
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Checkpoint save/load errors
    #[error("Checkpoint error at {path}: {reason}")]
    Checkpoint {
        path: PathBuf,
        reason: String,
    },

    /// Configuration loading errors
    #[error("Failed to load configuration from {path}: {reason}")]
    ConfigLoad {
        path: PathBuf,
        reason: String,
    },

    /// Speaker setup errors
    #[error("Speaker configuration error: {0}")]
    Speakers(String),

    /// A batch referenced a speaker the mapping does not know
    #[error("Unknown speaker '{0}'")]
    UnknownSpeaker(String),

    /// Tensor data could not be read back to the host
    #[error("Tensor data error: {0}")]
    TensorData(String),

    /// Tensor dimension errors
    #[error("Tensor dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        expected: String,
        actual: String,
    },

    /// Collective communication errors
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Test sentence synthesis errors
    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    /// Parameter validation errors
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The user interrupted the run
    #[error("Training interrupted")]
    Interrupted,

    /// Installing the interrupt handler failed
    #[error("Signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),

    /// Generic errors with custom message
    #[error("{0}")]
    Generic(String),
}

/// Type alias for the crate's Result type
pub type Result<T> = std::result::Result<T, TrainError>;

/// Extension trait for Result to add context to errors
pub trait ResultExt<T, E> {
    /// Add context to an error
    fn with_context<C, F>(self, context: F) -> std::result::Result<T, TrainError>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display;
}

impl<T, E: std::error::Error + 'static> ResultExt<T, E> for std::result::Result<T, E> {
    fn with_context<C, F>(self, context: F) -> std::result::Result<T, TrainError>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display,
    {
        self.map_err(|e| {
            TrainError::Generic(format!("{}: {}", context(), e))
        })
    }
}
