//! Payload schemas exchanged between pipeline stages.
//!
//! Field names are camelCase on the wire so worker implementations written in
//! any language can produce them directly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{AutoscribeError, Result, Stage, TaskIdentity};

// ---------------------------------------------------------------------------
// Plan stage
// ---------------------------------------------------------------------------

/// Task-level input handed to the Plan worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInput {
    pub story_id: String,
    pub test_id: String,
    pub test_case_file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_url: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlannedStep>,
    /// Elements the later stages must locate, each with a stable key.
    pub elements: Vec<TargetElement>,
    /// High-level action outline of the test.
    #[serde(default)]
    pub outline: Vec<String>,
    #[serde(default)]
    pub page_objects: Vec<PageObjectSketch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub number: u32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetElement {
    pub key_name: String,
    #[serde(default)]
    pub description: String,
}

/// Proposed page object or component and the element keys it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageObjectSketch {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
}

// ---------------------------------------------------------------------------
// Trace stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracePayload {
    pub elements: Vec<ElementPropertyRecord>,
    #[serde(default)]
    pub steps: Vec<RefinedStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinedStep {
    pub order: u32,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
}

/// Observed identifying properties of one UI element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPropertyRecord {
    pub key_name: String,
    #[serde(default)]
    pub tag_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub class_list: Vec<String>,
    #[serde(default, alias = "allAttributes")]
    pub attributes: BTreeMap<String, String>,
}

impl ElementPropertyRecord {
    pub fn new(key_name: impl Into<String>, tag_name: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            tag_name: tag_name.into(),
            id: None,
            class_list: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.class_list.extend(classes.into_iter().map(Into::into));
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Derive-Selectors stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectorStrategy {
    #[serde(rename = "ID")]
    Id,
    TestAttribute,
    NameAttribute,
    ClassCombination,
    OtherAttribute,
    TagOnly,
}

impl fmt::Display for SelectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectorStrategy::Id => "ID",
            SelectorStrategy::TestAttribute => "TestAttribute",
            SelectorStrategy::NameAttribute => "NameAttribute",
            SelectorStrategy::ClassCombination => "ClassCombination",
            SelectorStrategy::OtherAttribute => "OtherAttribute",
            SelectorStrategy::TagOnly => "TagOnly",
        };
        f.write_str(s)
    }
}

/// Qualitative robustness estimate, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Confidence {
    High,
    #[serde(rename = "Medium-High")]
    MediumHigh,
    Medium,
    #[serde(rename = "Medium-Low")]
    MediumLow,
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::High => "High",
            Confidence::MediumHigh => "Medium-High",
            Confidence::Medium => "Medium",
            Confidence::MediumLow => "Medium-Low",
            Confidence::Low => "Low",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorResult {
    pub key_name: String,
    pub selector: String,
    pub strategy_used: SelectorStrategy,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorPayload {
    pub selectors: Vec<SelectorResult>,
    /// Keys whose selector could only be derived with low confidence.
    #[serde(default)]
    pub ambiguous: Vec<String>,
}

// ---------------------------------------------------------------------------
// Emit stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitInput {
    pub plan: PlanPayload,
    pub trace: TracePayload,
    pub selectors: SelectorPayload,
}

/// Paths of the code artifacts an Emit worker produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitManifest {
    pub files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// StageInput / StagePayload — per-stage sum types
// ---------------------------------------------------------------------------

/// What a stage worker receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StageInput {
    Plan(PlanInput),
    Trace(PlanPayload),
    DeriveSelectors(Vec<ElementPropertyRecord>),
    Emit(EmitInput),
}

impl StageInput {
    pub fn stage(&self) -> Stage {
        match self {
            StageInput::Plan(_) => Stage::Plan,
            StageInput::Trace(_) => Stage::Trace,
            StageInput::DeriveSelectors(_) => Stage::DeriveSelectors,
            StageInput::Emit(_) => Stage::Emit,
        }
    }
}

/// What a stage worker produces, and what the artifact store persists.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StagePayload {
    Plan(PlanPayload),
    Trace(TracePayload),
    Selectors(SelectorPayload),
    Emit(EmitManifest),
}

impl StagePayload {
    /// The stage that owns this payload kind.
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Plan(_) => Stage::Plan,
            StagePayload::Trace(_) => Stage::Trace,
            StagePayload::Selectors(_) => Stage::DeriveSelectors,
            StagePayload::Emit(_) => Stage::Emit,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode `value` against the schema of `stage` and check its invariants.
    pub fn decode(stage: Stage, value: serde_json::Value) -> Result<Self> {
        let payload = match stage {
            Stage::Plan => StagePayload::Plan(serde_json::from_value(value)?),
            Stage::Trace => StagePayload::Trace(serde_json::from_value(value)?),
            Stage::DeriveSelectors => StagePayload::Selectors(serde_json::from_value(value)?),
            Stage::Emit => StagePayload::Emit(serde_json::from_value(value)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Every element must carry a non-empty key.
    pub fn validate(&self) -> Result<()> {
        let keys: Vec<&str> = match self {
            StagePayload::Plan(plan) => plan.elements.iter().map(|e| e.key_name.as_str()).collect(),
            StagePayload::Trace(trace) => {
                trace.elements.iter().map(|e| e.key_name.as_str()).collect()
            }
            StagePayload::Selectors(sel) => {
                sel.selectors.iter().map(|s| s.key_name.as_str()).collect()
            }
            StagePayload::Emit(_) => Vec::new(),
        };
        if keys.iter().any(|k| k.trim().is_empty()) {
            return Err(AutoscribeError::MissingInput {
                field: format!("{}.elements[].keyName", self.stage()),
            });
        }
        Ok(())
    }

    pub fn as_plan(&self) -> Option<&PlanPayload> {
        match self {
            StagePayload::Plan(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_trace(&self) -> Option<&TracePayload> {
        match self {
            StagePayload::Trace(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_selectors(&self) -> Option<&SelectorPayload> {
        match self {
            StagePayload::Selectors(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_emit(&self) -> Option<&EmitManifest> {
        match self {
            StagePayload::Emit(m) => Some(m),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact — persisted output of one stage for one task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub task: TaskIdentity,
    pub stage: Stage,
    pub payload: StagePayload,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn element_record_accepts_all_attributes_alias() {
        let record: ElementPropertyRecord = serde_json::from_value(json!({
            "keyName": "usernameInput",
            "tagName": "INPUT",
            "id": "user-id",
            "classList": ["form-control", "login-field"],
            "allAttributes": {"name": "username", "type": "text"}
        }))
        .unwrap();
        assert_eq!(record.key_name, "usernameInput");
        assert_eq!(record.attributes.get("name").unwrap(), "username");
        assert_eq!(record.class_list.len(), 2);
    }

    #[test]
    fn confidence_and_strategy_wire_names() {
        let result = SelectorResult {
            key_name: "submit".into(),
            selector: "#submit".into(),
            strategy_used: SelectorStrategy::Id,
            confidence: Confidence::MediumHigh,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["strategyUsed"], "ID");
        assert_eq!(json["confidence"], "Medium-High");
        assert_eq!(Confidence::MediumLow.to_string(), "Medium-Low");
    }

    #[test]
    fn confidence_orders_strongest_first() {
        assert!(Confidence::High < Confidence::MediumHigh);
        assert!(Confidence::Medium < Confidence::Low);
    }

    #[test]
    fn decode_checks_the_stage_schema() {
        let plan = json!({"elements": [{"keyName": "loginButton"}], "outline": ["open", "login"]});
        let decoded = StagePayload::decode(Stage::Plan, plan.clone()).unwrap();
        assert_eq!(decoded.stage(), Stage::Plan);
        assert_eq!(decoded.as_plan().unwrap().outline.len(), 2);

        // A plan document is not a valid emit manifest.
        assert!(StagePayload::decode(Stage::Emit, plan).is_err());
    }

    #[test]
    fn decode_rejects_blank_element_keys() {
        let trace = json!({"elements": [{"keyName": " ", "tagName": "div"}]});
        let err = StagePayload::decode(Stage::Trace, trace).unwrap_err();
        assert!(matches!(err, AutoscribeError::MissingInput { .. }));
    }

    #[test]
    fn untagged_serialization_is_the_bare_payload() {
        let payload = StagePayload::Emit(EmitManifest {
            files: vec![PathBuf::from("test/specs/login.e2e.js")],
            notes: None,
        });
        assert_eq!(
            payload.to_value().unwrap(),
            json!({"files": ["test/specs/login.e2e.js"]})
        );
    }
}
