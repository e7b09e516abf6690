//! Error types for the voice session

use thiserror::Error;

/// Result type alias for voice session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone missing, busy, or permission denied
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Audio payload could not be decoded
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Connection-level failure talking to the remote agent
    #[error("transport error: {0}")]
    Transport(String),

    /// Output device rejected or lost a buffer
    #[error("playback device error: {0}")]
    PlaybackDevice(String),

    /// The session controller task is gone
    #[error("session controller has shut down")]
    ControllerGone,

    /// Audio processing error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
