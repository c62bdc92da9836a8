//! Checkpointed stage orchestration for autoscribe.
//!
//! This crate turns a manual test case into automation artifacts by running it
//! through four stages (plan, trace, derive selectors, emit) with a checkpoint
//! after each, a deterministic selector engine, and a sequential bulk queue
//! with bounded per-task retries.

pub mod cases;
pub mod config;
pub mod engine;
pub mod events;
pub mod queue;
pub mod retry;
pub mod selector;
pub mod store;
pub mod worker;
pub mod workers;

pub use cases::{discover_test_ids, extract_test_ids, TestCaseType};
pub use config::{AutoscribeConfig, WorkerSpec, WorkersConfig};
pub use engine::{Halt, PipelineOrchestrator, PipelineRun, PipelineState, TaskRequest};
pub use events::{EventEmitter, PipelineEvent};
pub use queue::{
    run_bulk, BulkJobQueue, BulkOptions, BulkRequest, Job, JobReport, JobStatus, RunReport,
};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use selector::{derive, SelectorEngine, SelectorRules};
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use worker::{SelectorWorker, StageWorker, WorkerRegistry};
pub use workers::{CommandWorker, HttpWorker, WorkerRequest};
