//! Shared types, errors, payload schemas, and status markers for autoscribe.
//!
//! This crate provides the foundational types used across the other crates:
//! - `AutoscribeError` — unified error taxonomy and its `FailureKind`
//! - `TaskIdentity` — the (story, test) key that scopes every artifact
//! - `Stage` — the four ordered pipeline stages
//! - `StatusMarker` — terminal success/failure marker strings
//! - payload schemas exchanged between stages (see [`payload`])

pub mod payload;

pub use payload::{
    Artifact, Confidence, ElementPropertyRecord, EmitInput, EmitManifest, PageObjectSketch,
    PlanInput, PlanPayload, PlannedStep, RefinedStep, SelectorPayload, SelectorResult,
    SelectorStrategy, StageInput, StagePayload, TargetElement, TracePayload,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error type for all autoscribe subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AutoscribeError {
    // === Input Errors ===
    #[error("Missing required input: {field}")]
    MissingInput { field: String },

    #[error("Invalid task identity: {0}")]
    InvalidIdentity(String),

    // === Artifact Store Errors ===
    #[error("No {stage} artifact for task {task}")]
    NotFound { task: TaskIdentity, stage: Stage },

    #[error("Corrupt {stage} artifact for task {task} at {location}: {reason}")]
    CorruptArtifact {
        task: TaskIdentity,
        stage: Stage,
        location: String,
        reason: String,
    },

    #[error("Stage {stage} cannot store a {found} payload")]
    StageMismatch { stage: Stage, found: Stage },

    // === Worker Errors ===
    #[error("{stage} worker failed: {message}")]
    WorkerFailure { stage: Stage, message: String },

    #[error("{stage} worker timed out after {timeout_ms}ms")]
    WorkerTimeout { stage: Stage, timeout_ms: u64 },

    #[error("Transport error reaching {stage} worker: {message}")]
    Transport {
        stage: Stage,
        message: String,
        transient: bool,
    },

    // === Setup Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline validation failed: {0}")]
    Validation(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AutoscribeError {
    /// Returns `true` if a worker may retry the same call internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AutoscribeError::WorkerTimeout { .. }
                | AutoscribeError::Transport {
                    transient: true,
                    ..
                }
        )
    }

    /// Classify the error for halt reporting and whole-task retry decisions.
    pub fn kind(&self) -> FailureKind {
        match self {
            AutoscribeError::MissingInput { .. } | AutoscribeError::InvalidIdentity(_) => {
                FailureKind::MissingInput
            }
            AutoscribeError::NotFound { .. } => FailureKind::NotFound,
            AutoscribeError::CorruptArtifact { .. } => FailureKind::CorruptArtifact,
            AutoscribeError::StageMismatch { .. } => FailureKind::StageMismatch,
            AutoscribeError::WorkerFailure { .. }
            | AutoscribeError::WorkerTimeout { .. }
            | AutoscribeError::Transport { .. } => FailureKind::WorkerFailure,
            AutoscribeError::Config(_) | AutoscribeError::Validation(_) => {
                FailureKind::Configuration
            }
            AutoscribeError::Io(_) | AutoscribeError::Json(_) | AutoscribeError::Other(_) => {
                FailureKind::Storage
            }
        }
    }
}

/// A convenience alias for `Result<T, AutoscribeError>`.
pub type Result<T> = std::result::Result<T, AutoscribeError>;

// ---------------------------------------------------------------------------
// FailureKind — coarse classification of a halt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingInput,
    NotFound,
    CorruptArtifact,
    StageMismatch,
    WorkerFailure,
    Storage,
    Configuration,
}

impl FailureKind {
    /// Whether re-running the whole task from its checkpoint can help.
    pub fn allows_task_retry(self) -> bool {
        matches!(
            self,
            FailureKind::WorkerFailure | FailureKind::NotFound | FailureKind::Storage
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::MissingInput => "missing_input",
            FailureKind::NotFound => "not_found",
            FailureKind::CorruptArtifact => "corrupt_artifact",
            FailureKind::StageMismatch => "stage_mismatch",
            FailureKind::WorkerFailure => "worker_failure",
            FailureKind::Storage => "storage",
            FailureKind::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// TaskIdentity — (story, test) compound key
// ---------------------------------------------------------------------------

/// Stable compound key scoping all artifacts of one test case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdentity {
    pub story_id: String,
    pub test_id: String,
}

impl TaskIdentity {
    /// Build a validated identity.
    pub fn new(story_id: impl Into<String>, test_id: impl Into<String>) -> Result<Self> {
        let task = Self {
            story_id: story_id.into(),
            test_id: test_id.into(),
        };
        task.validate()?;
        Ok(task)
    }

    /// Both parts must be non-empty single path segments.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("story_id", &self.story_id), ("test_id", &self.test_id)] {
            if value.trim().is_empty() {
                return Err(AutoscribeError::MissingInput {
                    field: field.to_string(),
                });
            }
            if value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
                return Err(AutoscribeError::InvalidIdentity(format!(
                    "{field} '{value}' is not a single path segment"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.story_id, self.test_id)
    }
}

// ---------------------------------------------------------------------------
// Stage — the four ordered processing steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Trace,
    DeriveSelectors,
    Emit,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [Stage::Plan, Stage::Trace, Stage::DeriveSelectors, Stage::Emit];

    /// The stage whose artifact this stage consumes, if any.
    pub fn predecessor(self) -> Option<Stage> {
        match self {
            Stage::Plan => None,
            Stage::Trace => Some(Stage::Plan),
            Stage::DeriveSelectors => Some(Stage::Trace),
            Stage::Emit => Some(Stage::DeriveSelectors),
        }
    }

    /// Name used in checkpoint file names.
    pub fn checkpoint_name(self) -> &'static str {
        match self {
            Stage::Plan => "planner",
            Stage::Trace => "analyzer",
            Stage::DeriveSelectors => "selector_extractor",
            Stage::Emit => "test_writer",
        }
    }

    /// Component name used in status markers.
    pub fn component(self) -> &'static str {
        match self {
            Stage::Plan => "Planner",
            Stage::Trace => "Analyzer",
            Stage::DeriveSelectors => "SelectorExtractor",
            Stage::Emit => "TestWriter",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Trace => "trace",
            Stage::DeriveSelectors => "derive_selectors",
            Stage::Emit => "emit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = AutoscribeError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s || stage.checkpoint_name() == s)
            .ok_or_else(|| AutoscribeError::Other(format!("unknown stage '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// StatusMarker — terminal success/failure signal strings
// ---------------------------------------------------------------------------

const SUCCESS_GLYPH: &str = "\u{2705}";
const FAILURE_GLYPH: &str = "\u{274C}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Success,
    Failure,
}

/// A single-line terminal marker such as `✅ Planner: plan written`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMarker {
    pub kind: MarkerKind,
    pub component: String,
    pub message: String,
}

impl StatusMarker {
    pub fn success(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: MarkerKind::Success,
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn failure(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: MarkerKind::Failure,
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == MarkerKind::Success
    }

    /// Parse a marker line. Returns `None` for anything that is not a marker.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (kind, rest) = if let Some(rest) = line.strip_prefix(SUCCESS_GLYPH) {
            (MarkerKind::Success, rest)
        } else if let Some(rest) = line.strip_prefix(FAILURE_GLYPH) {
            (MarkerKind::Failure, rest)
        } else {
            return None;
        };
        let (component, message) = rest.trim_start().split_once(':')?;
        if component.trim().is_empty() {
            return None;
        }
        Some(Self {
            kind,
            component: component.trim().to_string(),
            message: message.trim().to_string(),
        })
    }
}

impl fmt::Display for StatusMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let glyph = match self.kind {
            MarkerKind::Success => SUCCESS_GLYPH,
            MarkerKind::Failure => FAILURE_GLYPH,
        };
        write!(f, "{} {}: {}", glyph, self.component, self.message)
    }
}
