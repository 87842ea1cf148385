//! Road hazards: the in-memory application state the voice assistant reads
//! and writes through its tool calls.

pub mod handler;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use handler::HazardToolHandler;

// ── Enumerations ─────────────────────────────────────────────────

/// Kind of road hazard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HazardType {
    Pothole,
    Accident,
    Debris,
    Construction,
    Waterlogging,
    Other,
}

impl HazardType {
    /// Wire value, as declared to the assistant.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pothole => "POTHOLE",
            Self::Accident => "ACCIDENT",
            Self::Debris => "DEBRIS",
            Self::Construction => "CONSTRUCTION",
            Self::Waterlogging => "WATERLOGGING",
            Self::Other => "OTHER",
        }
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pothole => "Pothole",
            Self::Accident => "Accident",
            Self::Debris => "Debris",
            Self::Construction => "Construction",
            Self::Waterlogging => "Water Logging",
            Self::Other => "Other Hazard",
        }
    }

    /// Parse a wire value (case-insensitive).
    pub fn from_str_code(code: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(code.trim()))
    }

    pub fn all() -> &'static [HazardType] {
        &[
            Self::Pothole,
            Self::Accident,
            Self::Debris,
            Self::Construction,
            Self::Waterlogging,
            Self::Other,
        ]
    }
}

impl std::fmt::Display for HazardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How dangerous a hazard is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn from_str_code(code: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|s| s.as_str().eq_ignore_ascii_case(code.trim()))
    }

    pub fn all() -> &'static [Severity] {
        &[Self::Low, Self::Medium, Self::High, Self::Critical]
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Moderation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HazardStatus {
    Open,
    Verified,
    Resolved,
}

/// Where a report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HazardSource {
    User,
    Sensor,
    Authority,
}

// ── Hazard record ────────────────────────────────────────────────

/// A reported road hazard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hazard {
    pub id: String,
    #[serde(rename = "type")]
    pub hazard_type: HazardType,
    pub severity: Severity,
    pub status: HazardStatus,
    pub latitude: f64,
    pub longitude: f64,
    pub description: String,
    /// Epoch milliseconds.
    pub reported_at: i64,
    pub upvotes: u32,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporter_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<HazardSource>,
}

impl Hazard {
    /// A fresh, unverified report at the given position.
    pub fn new(
        hazard_type: HazardType,
        severity: Severity,
        description: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            hazard_type,
            severity,
            status: HazardStatus::Open,
            latitude,
            longitude,
            description: description.into(),
            reported_at: chrono::Utc::now().timestamp_millis(),
            upvotes: 0,
            verified: false,
            reporter_name: None,
            reporter_id: None,
            source: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != HazardStatus::Resolved
    }
}

// ── Store ────────────────────────────────────────────────────────

/// Shared in-memory list of hazards, newest first.
#[derive(Debug, Clone, Default)]
pub struct HazardStore {
    hazards: Arc<RwLock<Vec<Hazard>>>,
}

impl HazardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hazards(hazards: Vec<Hazard>) -> Self {
        Self {
            hazards: Arc::new(RwLock::new(hazards)),
        }
    }

    /// Prepend a report so the feed shows it first.
    pub fn add(&self, hazard: Hazard) {
        self.hazards.write().insert(0, hazard);
    }

    pub fn snapshot(&self) -> Vec<Hazard> {
        self.hazards.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Hazard> {
        self.hazards.read().iter().find(|h| h.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.hazards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hazards.read().is_empty()
    }

    /// Up to `limit` hazards that are not resolved, in feed order.
    pub fn active(&self, limit: usize) -> Vec<Hazard> {
        self.hazards
            .read()
            .iter()
            .filter(|h| h.is_active())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Add one upvote. Returns the new count.
    pub fn upvote(&self, id: &str) -> Option<u32> {
        self.update(id, |h| {
            h.upvotes = h.upvotes.saturating_add(1);
            h.upvotes
        })
    }

    /// Mark a hazard as verified by a moderator.
    pub fn verify(&self, id: &str) -> bool {
        self.update(id, |h| {
            h.verified = true;
            h.status = HazardStatus::Verified;
        })
        .is_some()
    }

    pub fn set_status(&self, id: &str, status: HazardStatus) -> bool {
        self.update(id, |h| h.status = status).is_some()
    }

    pub fn remove(&self, id: &str) -> Option<Hazard> {
        let mut hazards = self.hazards.write();
        let pos = hazards.iter().position(|h| h.id == id)?;
        Some(hazards.remove(pos))
    }

    fn update<T>(&self, id: &str, f: impl FnOnce(&mut Hazard) -> T) -> Option<T> {
        let mut hazards = self.hazards.write();
        hazards.iter_mut().find(|h| h.id == id).map(f)
    }
}
