//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (progress printers, report writers, tests) can follow a
//! run without coupling to the orchestrator or queue internals.

use autoscribe_types::{FailureKind, Stage, TaskIdentity};
use serde::{Deserialize, Serialize};

use crate::queue::JobStatus;

/// Events emitted during pipeline and bulk execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    TaskStarted {
        task: TaskIdentity,
    },
    TaskCompleted {
        task: TaskIdentity,
        invoked: Vec<Stage>,
        resumed: Vec<Stage>,
        duration_ms: u64,
    },
    TaskHalted {
        task: TaskIdentity,
        stage: Stage,
        kind: FailureKind,
        message: String,
    },
    StageResumed {
        task: TaskIdentity,
        stage: Stage,
    },
    StageStarted {
        task: TaskIdentity,
        stage: Stage,
    },
    StageCompleted {
        task: TaskIdentity,
        stage: Stage,
        duration_ms: u64,
    },
    StageFailed {
        task: TaskIdentity,
        stage: Stage,
        error: String,
    },
    ArtifactWritten {
        task: TaskIdentity,
        stage: Stage,
    },
    JobRetrying {
        task: TaskIdentity,
        attempt: u32,
        max_attempts: u32,
    },
    JobFinished {
        task: TaskIdentity,
        status: JobStatus,
        attempts: u32,
    },
    BulkFinished {
        succeeded: usize,
        failed: usize,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
