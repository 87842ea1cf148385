//! Error types for the voice layer.
//!
//! None of these cross the [`VoiceSessionManager`](super::VoiceSessionManager)
//! boundary: the manager turns every one of them into a
//! [`ConnectionStatus::Error`](super::ConnectionStatus::Error) transition.

use thiserror::Error;

/// Result type for voice operations.
pub type Result<T> = std::result::Result<T, VoiceError>;

/// Errors raised while setting up or running a voice session.
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone permission denied or no input device.
    #[error("Microphone unavailable: {0}")]
    Microphone(String),

    /// Output device could not be opened or rejected a buffer.
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Handshake with the live API failed (network, rejected setup, timeout).
    #[error("Failed to open live session: {0}")]
    SessionOpen(String),

    /// Fault on an already-open session.
    #[error("Live session transport error: {0}")]
    Transport(String),

    /// Session handle is gone (disconnected or superseded).
    #[error("Session not connected")]
    NotConnected,

    /// Malformed inbound audio payload.
    #[error("Audio format error: {0}")]
    AudioFormat(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VoiceError {
    pub fn microphone<S: Into<String>>(msg: S) -> Self {
        Self::Microphone(msg.into())
    }

    pub fn audio_output<S: Into<String>>(msg: S) -> Self {
        Self::AudioOutput(msg.into())
    }

    pub fn session_open<S: Into<String>>(msg: S) -> Self {
        Self::SessionOpen(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }
}
