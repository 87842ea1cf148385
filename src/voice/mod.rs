//! Real-time voice assistant for SafeTravel.
//!
//! Bridges the local microphone and speaker to the Gemini Live API and
//! relays the assistant's tool calls to the host application.
//!
//! ## Design
//! - [`VoiceSessionManager`] owns at most one live session at a time
//! - Wire protocol and WebSocket loops live in [`gemini_live`]; the manager
//!   only sees the [`LiveTransport`] trait
//! - Microphone and speaker are traits ([`AudioInput`], [`AudioOutputFactory`]);
//!   the cpal-backed implementations sit behind the `device-audio` feature
//! - Inbound audio is scheduled gaplessly by [`PlaybackQueue`]

pub mod audio;
pub mod capture;
#[cfg(feature = "device-audio")]
pub mod device;
pub mod error;
pub mod gemini_live;
pub mod playback;
pub mod session;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

use gemini_live::FunctionCall;

// ── Shared voice event type ──────────────────────────────────────

/// Event produced by a live session's inbound loop.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// Setup completed; ready to stream.
    SetupComplete,
    /// Assistant audio chunk (PCM16, 24kHz mono).
    Audio { data: Vec<u8> },
    /// Transcription of the user's speech.
    InputTranscript { text: String },
    /// Transcription or text part of the assistant's reply.
    OutputTranscript { text: String },
    /// Model finished a response turn.
    TurnComplete,
    /// The user started speaking over the assistant.
    Interrupted,
    /// The model wants one or more declared tools to run.
    ToolCall { calls: Vec<FunctionCall> },
    /// The model no longer needs the results of these calls.
    ToolCallCancellation { ids: Vec<String> },
    /// Server will close the connection soon.
    GoAway { time_left: Option<String> },
    /// Backend closed the session.
    Closed { reason: Option<String> },
    /// Transport fault or server-reported error.
    Error { message: String },
}

pub use audio::AudioBuffer;
pub use capture::{AudioInput, CaptureSink, InputStream};
pub use error::VoiceError;
pub use gemini_live::{GeminiLiveTransport, LiveConnection, LiveSender, LiveTransport};
pub use playback::{AudioOutput, AudioOutputFactory, PlaybackQueue};
pub use session::{ConnectionStatus, StatusCallback, ToolHandler, VoiceSessionManager};
