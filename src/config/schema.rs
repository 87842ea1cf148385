//! Configuration schema (`~/.safetravel/config.toml`).
//!
//! Every field has a default, so an empty or missing file is valid.

use serde::{Deserialize, Serialize};

use crate::voice::audio::DEFAULT_CAPTURE_BLOCK_FRAMES;

/// Gemini Live WebSocket endpoint.
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used for the assistant.
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub voice: VoiceSettings,
    pub location: LocationConfig,
}

/// `[voice]` section: live API and audio pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Gemini API key. `GEMINI_API_KEY` overrides it.
    pub api_key: Option<String>,
    /// Model id, without the `models/` prefix.
    pub model: String,
    /// Prebuilt voice name.
    pub voice_name: String,
    /// WebSocket endpoint.
    pub endpoint: String,
    /// Seconds to wait for `setupComplete`.
    pub setup_timeout_secs: u64,
    /// Frames per outbound microphone chunk.
    pub capture_block_frames: usize,
    /// Outbound queue capacity; audio is dropped when it is full.
    pub outbound_queue_depth: usize,
    /// Inbound event queue capacity.
    pub event_queue_depth: usize,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice_name: "Kore".to_string(),
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            setup_timeout_secs: 15,
            capture_block_frames: DEFAULT_CAPTURE_BLOCK_FRAMES,
            outbound_queue_depth: 256,
            event_queue_depth: 256,
        }
    }
}

/// `[location]` section: where voice reports are placed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for LocationConfig {
    /// Mumbai.
    fn default() -> Self {
        Self {
            latitude: 19.0760,
            longitude: 72.8777,
        }
    }
}
