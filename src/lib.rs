//! SafeTravel: a voice assistant for community road-hazard reporting.
//!
//! Drivers talk to a real-time speech assistant; the assistant files hazard
//! reports and reads out open hazards through two declared tools.

pub mod config;
pub mod hazards;
pub mod voice;

pub use config::Config;
pub use hazards::{Hazard, HazardStore, HazardToolHandler};
pub use voice::{ConnectionStatus, VoiceSessionManager};
