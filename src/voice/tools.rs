//! Capabilities declared to the assistant at session open, plus its persona.

use serde::Serialize;
use serde_json::{json, Value};

use crate::hazards::{HazardType, Severity};

/// Tool name for filing a new hazard report.
pub const REPORT_HAZARD: &str = "reportHazard";

/// Tool name for reading out open hazards.
pub const GET_HAZARDS_NEARBY: &str = "getHazardsNearby";

/// One entry of `tools[].functionDeclarations`.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Wrapper matching the `tools` array element of the setup message.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSet {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

fn report_hazard_declaration() -> FunctionDeclaration {
    let types: Vec<&str> = HazardType::all().iter().map(|t| t.as_str()).collect();
    let severities: Vec<&str> = Severity::all().iter().map(|s| s.as_str()).collect();

    FunctionDeclaration {
        name: REPORT_HAZARD.to_string(),
        description: "File a new road hazard from what the driver describes. Use it when the \
                      driver says things like \"there is a pothole\" or \"accident ahead\"."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "type": {
                    "type": "STRING",
                    "enum": types,
                    "description": "Kind of hazard being reported.",
                },
                "severity": {
                    "type": "STRING",
                    "enum": severities,
                    "description": "How dangerous the hazard is. Judge it from the driver's tone \
                                    and wording (\"huge\" means HIGH or CRITICAL).",
                },
                "description": {
                    "type": "STRING",
                    "description": "Short description of the hazard, 5 to 10 words.",
                },
            },
            "required": ["type", "description"],
        }),
    }
}

fn hazards_nearby_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: GET_HAZARDS_NEARBY.to_string(),
        description: "List the open hazards near the driver so they can be read aloud. Use it \
                      when the driver asks whether the road is safe or what is ahead."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {},
        }),
    }
}

/// The two declared capabilities, in declaration order.
pub fn hazard_tools() -> Vec<ToolSet> {
    vec![ToolSet {
        function_declarations: vec![report_hazard_declaration(), hazards_nearby_declaration()],
    }]
}

/// System instruction for the SafeTravel assistant.
pub fn system_prompt() -> String {
    format!(
        "You are SafeTravel AI, a road safety companion for drivers in India. \
         Collect hazard reports from drivers and warn them about dangers on the road.\n\
         \n\
         Persona: friendly, professional and brief, because the listener is driving. \
         Understand Indian English and local words such as 'gadda', 'jam' or 'breakdown'. \
         When someone reports something serious like an accident, be empathetic but log it quickly.\n\
         \n\
         Tools:\n\
         1. {REPORT_HAZARD}(type, severity, description): call it when the driver describes a problem. \
         Infer severity from how they describe it: a huge pothole is HIGH, a small crack is LOW, \
         a car crash is CRITICAL.\n\
         2. {GET_HAZARDS_NEARBY}(): call it when the driver asks for an update, then summarise \
         the returned hazards out loud.\n\
         \n\
         Keep every reply under ten seconds. Confirm actions, for example \"Reported the pothole.\" \
         If the driver just says hello, greet them and ask whether they see any hazards."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_two_tools_declared() {
        let tools = hazard_tools();
        assert_eq!(tools.len(), 1);
        let names: Vec<&str> = tools[0]
            .function_declarations
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec![REPORT_HAZARD, GET_HAZARDS_NEARBY]);
    }

    #[test]
    fn report_hazard_enumerates_types_and_severities() {
        let decl = report_hazard_declaration();
        let props = &decl.parameters["properties"];
        assert_eq!(props["type"]["enum"].as_array().unwrap().len(), 6);
        assert!(props["type"]["enum"]
            .as_array()
            .unwrap()
            .contains(&json!("WATERLOGGING")));
        assert_eq!(
            props["severity"]["enum"],
            json!(["LOW", "MEDIUM", "HIGH", "CRITICAL"])
        );
        assert_eq!(decl.parameters["required"], json!(["type", "description"]));
        assert!(props["severity"]["description"]
            .as_str()
            .unwrap()
            .contains("tone"));
    }

    #[test]
    fn nearby_takes_no_parameters() {
        let decl = hazards_nearby_declaration();
        assert!(decl.parameters["properties"].as_object().unwrap().is_empty());
    }

    #[test]
    fn serializes_with_camel_case_wrapper() {
        let json = serde_json::to_string(&hazard_tools()).unwrap();
        assert!(json.contains("functionDeclarations"));
        assert!(json.contains("\"reportHazard\""));
    }

    #[test]
    fn prompt_names_both_tools() {
        let prompt = system_prompt();
        assert!(prompt.contains("SafeTravel AI"));
        assert!(prompt.contains(REPORT_HAZARD));
        assert!(prompt.contains(GET_HAZARDS_NEARBY));
    }
}
