//! Host-side execution of the assistant's hazard tools.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Hazard, HazardSource, HazardStore, HazardType, Severity};
use crate::config::LocationConfig;
use crate::voice::tools::{GET_HAZARDS_NEARBY, REPORT_HAZARD};
use crate::voice::ToolHandler;

/// Maximum number of hazards read out by `getHazardsNearby`.
pub const NEARBY_LIMIT: usize = 5;

const VOICE_REPORTER: &str = "Voice Assistant";
const DEFAULT_DESCRIPTION: &str = "Reported via Voice Assistant";

/// Runs `reportHazard` / `getHazardsNearby` against a [`HazardStore`].
#[derive(Debug, Clone)]
pub struct HazardToolHandler {
    store: HazardStore,
    location: LocationConfig,
}

impl HazardToolHandler {
    pub fn new(store: HazardStore, location: LocationConfig) -> Self {
        Self { store, location }
    }

    pub fn store(&self) -> &HazardStore {
        &self.store
    }

    fn report_hazard(&self, args: &Value) -> Value {
        let hazard_type = args
            .get("type")
            .and_then(Value::as_str)
            .and_then(HazardType::from_str_code)
            .unwrap_or(HazardType::Other);
        let severity = args
            .get("severity")
            .and_then(Value::as_str)
            .and_then(Severity::from_str_code)
            .unwrap_or(Severity::Medium);
        let description = args
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DESCRIPTION);

        let mut hazard = Hazard::new(
            hazard_type,
            severity,
            description,
            self.location.latitude,
            self.location.longitude,
        );
        hazard.reporter_name = Some(VOICE_REPORTER.to_string());
        hazard.source = Some(HazardSource::User);

        tracing::info!(
            hazard_id = %hazard.id,
            hazard_type = hazard_type.as_str(),
            severity = severity.as_str(),
            "Voice report added"
        );
        self.store.add(hazard);

        json!({ "result": "Hazard reported successfully." })
    }

    fn hazards_nearby(&self) -> Value {
        let nearby: Vec<Value> = self
            .store
            .active(NEARBY_LIMIT)
            .into_iter()
            .map(|h| {
                json!({
                    "type": h.hazard_type,
                    "severity": h.severity,
                    "description": h.description,
                })
            })
            .collect();

        if nearby.is_empty() {
            json!({ "hazards": "No hazards nearby." })
        } else {
            json!({ "hazards": nearby })
        }
    }
}

#[async_trait]
impl ToolHandler for HazardToolHandler {
    async fn call(&self, name: &str, args: Value) -> anyhow::Result<Value> {
        tracing::debug!(tool = name, args = %args, "Tool called");
        Ok(match name {
            REPORT_HAZARD => self.report_hazard(&args),
            GET_HAZARDS_NEARBY => self.hazards_nearby(),
            _ => json!({ "error": "Unknown tool" }),
        })
    }
}
