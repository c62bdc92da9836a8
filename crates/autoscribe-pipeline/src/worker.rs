//! Stage worker trait, worker registry, and the built-in selector worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use autoscribe_types::{AutoscribeError, Result, Stage, StageInput, StagePayload, TaskIdentity};

use crate::selector::SelectorEngine;

// ---------------------------------------------------------------------------
// StageWorker trait
// ---------------------------------------------------------------------------

/// One of the four processing stages. Implementations are opaque to the
/// orchestrator: a call either returns the stage payload or fails.
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// The stage this worker implements.
    fn stage(&self) -> Stage;

    /// Human-readable name used in logs.
    fn name(&self) -> &str {
        self.stage().component()
    }

    /// Run the stage for `task`. May block for a long time.
    async fn invoke(&self, task: &TaskIdentity, input: StageInput) -> Result<StagePayload>;
}

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

/// One worker per stage.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<Stage, Arc<dyn StageWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` for its stage, replacing any previous one.
    pub fn register(&mut self, worker: impl StageWorker + 'static) {
        self.register_shared(Arc::new(worker));
    }

    pub fn register_shared(&mut self, worker: Arc<dyn StageWorker>) {
        let stage = worker.stage();
        if self.workers.insert(stage, worker).is_some() {
            tracing::debug!(stage = %stage, "Replacing registered worker");
        }
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageWorker>> {
        self.workers.get(&stage)
    }

    pub fn has(&self, stage: Stage) -> bool {
        self.workers.contains_key(&stage)
    }

    /// Stages with no registered worker, in pipeline order.
    pub fn missing(&self) -> Vec<Stage> {
        Stage::ALL.into_iter().filter(|s| !self.has(*s)).collect()
    }

    /// Fail unless every stage has a worker.
    pub fn ensure_complete(&self) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
        Err(AutoscribeError::Validation(format!(
            "no worker registered for stage(s): {}",
            names.join(", ")
        )))
    }
}

// ---------------------------------------------------------------------------
// SelectorWorker — built-in Derive-Selectors stage
// ---------------------------------------------------------------------------

/// Derive-Selectors implemented with the deterministic [`SelectorEngine`].
/// Looks at nothing but the element records it is handed.
#[derive(Debug, Clone, Default)]
pub struct SelectorWorker {
    engine: SelectorEngine,
}

impl SelectorWorker {
    pub fn new(engine: SelectorEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl StageWorker for SelectorWorker {
    fn stage(&self) -> Stage {
        Stage::DeriveSelectors
    }

    async fn invoke(&self, task: &TaskIdentity, input: StageInput) -> Result<StagePayload> {
        let records = match input {
            StageInput::DeriveSelectors(records) => records,
            other => {
                return Err(AutoscribeError::WorkerFailure {
                    stage: Stage::DeriveSelectors,
                    message: format!("expected element records, got {} input", other.stage()),
                })
            }
        };
        if records.is_empty() {
            return Err(AutoscribeError::MissingInput {
                field: "trace.elements".into(),
            });
        }

        let payload = self.engine.derive_all(&records);
        tracing::info!(
            task = %task,
            selectors = payload.selectors.len(),
            ambiguous = payload.ambiguous.len(),
            "Selectors derived"
        );
        Ok(StagePayload::Selectors(payload))
    }
}
