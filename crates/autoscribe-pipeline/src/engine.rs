//! Pipeline orchestrator: drives one task through Plan → Trace →
//! Derive-Selectors → Emit.
//!
//! For every stage the store is consulted first. A stage whose artifact
//! already exists is loaded and skipped; otherwise its predecessor's artifact
//! must exist, the worker is invoked once, and the result is persisted before
//! moving on. The first failure halts the run. Earlier artifacts are never
//! rolled back, so the next run resumes at the first incomplete stage.

use std::sync::Arc;
use std::time::Instant;

use autoscribe_types::{
    AutoscribeError, EmitInput, EmitManifest, FailureKind, PlanInput, PlanPayload, Result,
    SelectorPayload, Stage, StageInput, StagePayload, StatusMarker, TaskIdentity, TracePayload,
};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::events::{EventEmitter, PipelineEvent};
use crate::store::ArtifactStore;
use crate::worker::WorkerRegistry;

const COMPONENT: &str = "Orchestrator";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Drives single tasks through the four stages.
pub struct PipelineOrchestrator {
    store: Arc<dyn ArtifactStore>,
    workers: WorkerRegistry,
    events: Option<EventEmitter>,
}

/// What the orchestrator needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task: TaskIdentity,
    /// Name of the manual test-case document the planner reads.
    pub test_case_file_name: String,
}

impl TaskRequest {
    pub fn new(task: TaskIdentity, test_case_file_name: impl Into<String>) -> Self {
        Self {
            task,
            test_case_file_name: test_case_file_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Planning,
    Tracing,
    DerivingSelectors,
    Emitting,
    Completed,
    Halted,
}

impl PipelineState {
    fn working_on(stage: Stage) -> Self {
        match stage {
            Stage::Plan => PipelineState::Planning,
            Stage::Trace => PipelineState::Tracing,
            Stage::DeriveSelectors => PipelineState::DerivingSelectors,
            Stage::Emit => PipelineState::Emitting,
        }
    }
}

/// Where and why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Halt {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub task: TaskIdentity,
    pub state: PipelineState,
    /// Stages whose worker was invoked and whose artifact was written.
    pub invoked: Vec<Stage>,
    /// Stages satisfied from an existing checkpoint.
    pub resumed: Vec<Stage>,
    pub halt: Option<Halt>,
    /// One marker per stage reached, in order.
    pub markers: Vec<StatusMarker>,
    /// Emit manifest, when the run completed.
    pub manifest: Option<EmitManifest>,
}

impl PipelineRun {
    fn new(task: TaskIdentity) -> Self {
        Self {
            task,
            state: PipelineState::NotStarted,
            invoked: Vec::new(),
            resumed: Vec::new(),
            halt: None,
            markers: Vec::new(),
            manifest: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == PipelineState::Completed
    }

    /// Terminal marker for the whole task.
    pub fn marker(&self) -> StatusMarker {
        match &self.halt {
            None => StatusMarker::success(
                COMPONENT,
                format!(
                    "{} automated ({} stage(s) run, {} resumed)",
                    self.task,
                    self.invoked.len(),
                    self.resumed.len()
                ),
            ),
            Some(halt) => StatusMarker::failure(
                COMPONENT,
                format!(
                    "{} halted at {} ({}): {}",
                    self.task, halt.stage, halt.kind, halt.message
                ),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage outputs held in memory during a run
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StageOutputs {
    plan: Option<PlanPayload>,
    trace: Option<TracePayload>,
    selectors: Option<SelectorPayload>,
    manifest: Option<EmitManifest>,
}

impl StageOutputs {
    fn record(&mut self, payload: StagePayload) {
        match payload {
            StagePayload::Plan(p) => self.plan = Some(p),
            StagePayload::Trace(t) => self.trace = Some(t),
            StagePayload::Selectors(s) => self.selectors = Some(s),
            StagePayload::Emit(m) => self.manifest = Some(m),
        }
    }

    /// Build the input for `stage` from what earlier stages produced.
    fn input_for(&self, stage: Stage, request: &TaskRequest) -> Result<StageInput> {
        let task = &request.task;
        let missing = |stage: Stage| AutoscribeError::NotFound {
            task: task.clone(),
            stage,
        };
        match stage {
            Stage::Plan => {
                if request.test_case_file_name.trim().is_empty() {
                    return Err(AutoscribeError::MissingInput {
                        field: "test_case_file_name".into(),
                    });
                }
                Ok(StageInput::Plan(PlanInput {
                    story_id: task.story_id.clone(),
                    test_id: task.test_id.clone(),
                    test_case_file_name: request.test_case_file_name.clone(),
                }))
            }
            Stage::Trace => {
                let plan = self.plan.clone().ok_or_else(|| missing(Stage::Plan))?;
                Ok(StageInput::Trace(plan))
            }
            Stage::DeriveSelectors => {
                let trace = self.trace.as_ref().ok_or_else(|| missing(Stage::Trace))?;
                Ok(StageInput::DeriveSelectors(trace.elements.clone()))
            }
            Stage::Emit => Ok(StageInput::Emit(EmitInput {
                plan: self.plan.clone().ok_or_else(|| missing(Stage::Plan))?,
                trace: self.trace.clone().ok_or_else(|| missing(Stage::Trace))?,
                selectors: self
                    .selectors
                    .clone()
                    .ok_or_else(|| missing(Stage::DeriveSelectors))?,
            })),
        }
    }
}

enum StageOutcome {
    Resumed,
    Invoked,
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

impl PipelineOrchestrator {
    /// Fails if any stage has no registered worker.
    pub fn new(store: Arc<dyn ArtifactStore>, workers: WorkerRegistry) -> Result<Self> {
        workers.ensure_complete()?;
        Ok(Self {
            store,
            workers,
            events: None,
        })
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn events(&self) -> Option<&EventEmitter> {
        self.events.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Run `request` to `Completed` or `Halted`. Never returns an error: every
    /// failure is reported through [`PipelineRun::halt`].
    pub async fn run(&self, request: &TaskRequest) -> PipelineRun {
        let span = tracing::info_span!(
            "task",
            story = %request.task.story_id,
            test = %request.task.test_id
        );
        self.run_task(request).instrument(span).await
    }

    async fn run_task(&self, request: &TaskRequest) -> PipelineRun {
        let task = &request.task;
        let started = Instant::now();
        let mut run = PipelineRun::new(task.clone());

        tracing::info!(story = %task.story_id, test = %task.test_id, "Starting task");
        self.emit(PipelineEvent::TaskStarted { task: task.clone() });

        if let Err(e) = task.validate() {
            self.halt(&mut run, Stage::Plan, e);
            return run;
        }

        let mut outputs = StageOutputs::default();
        for stage in Stage::ALL {
            run.state = PipelineState::working_on(stage);
            match self.advance(request, stage, &mut outputs).await {
                Ok(StageOutcome::Resumed) => {
                    run.resumed.push(stage);
                    run.markers.push(StatusMarker::success(
                        stage.component(),
                        format!("resumed {task} from checkpoint"),
                    ));
                }
                Ok(StageOutcome::Invoked) => {
                    run.invoked.push(stage);
                    run.markers.push(StatusMarker::success(
                        stage.component(),
                        format!("{stage} artifact written for {task}"),
                    ));
                }
                Err(e) => {
                    self.halt(&mut run, stage, e);
                    return run;
                }
            }
        }

        run.state = PipelineState::Completed;
        run.manifest = outputs.manifest;
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            story = %task.story_id,
            test = %task.test_id,
            invoked = run.invoked.len(),
            resumed = run.resumed.len(),
            duration_ms,
            "Task completed"
        );
        self.emit(PipelineEvent::TaskCompleted {
            task: task.clone(),
            invoked: run.invoked.clone(),
            resumed: run.resumed.clone(),
            duration_ms,
        });
        run
    }

    async fn advance(
        &self,
        request: &TaskRequest,
        stage: Stage,
        outputs: &mut StageOutputs,
    ) -> Result<StageOutcome> {
        let task = &request.task;

        // 1. Resume path: never re-invoke a stage that has a checkpoint.
        if self.store.exists(task, stage).await? {
            let artifact = self.store.read(task, stage).await?;
            tracing::info!(
                story = %task.story_id,
                test = %task.test_id,
                stage = %stage,
                "Resuming from checkpoint"
            );
            self.emit(PipelineEvent::StageResumed {
                task: task.clone(),
                stage,
            });
            outputs.record(artifact.payload);
            return Ok(StageOutcome::Resumed);
        }

        // 2. The predecessor's artifact must be durable before we build on it.
        if let Some(prev) = stage.predecessor() {
            if !self.store.exists(task, prev).await? {
                return Err(AutoscribeError::NotFound {
                    task: task.clone(),
                    stage: prev,
                });
            }
        }

        let input = outputs.input_for(stage, request)?;
        let worker = self.workers.get(stage).ok_or_else(|| {
            AutoscribeError::Validation(format!("no worker registered for stage {stage}"))
        })?;

        // 3. Invoke exactly once.
        let started = Instant::now();
        tracing::info!(
            story = %task.story_id,
            test = %task.test_id,
            stage = %stage,
            worker = %worker.name(),
            "Invoking stage worker"
        );
        self.emit(PipelineEvent::StageStarted {
            task: task.clone(),
            stage,
        });
        let payload = worker.invoke(task, input).await?;

        // 4. Persist before advancing.
        let artifact = self.store.write(task, stage, payload).await?;
        self.emit(PipelineEvent::ArtifactWritten {
            task: task.clone(),
            stage,
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            story = %task.story_id,
            test = %task.test_id,
            stage = %stage,
            duration_ms,
            "Stage completed"
        );
        self.emit(PipelineEvent::StageCompleted {
            task: task.clone(),
            stage,
            duration_ms,
        });
        outputs.record(artifact.payload);
        Ok(StageOutcome::Invoked)
    }

    fn halt(&self, run: &mut PipelineRun, stage: Stage, error: AutoscribeError) {
        let kind = error.kind();
        let message = error.to_string();
        tracing::error!(
            story = %run.task.story_id,
            test = %run.task.test_id,
            stage = %stage,
            kind = %kind,
            error = %message,
            "Task halted"
        );
        self.emit(PipelineEvent::StageFailed {
            task: run.task.clone(),
            stage,
            error: message.clone(),
        });
        self.emit(PipelineEvent::TaskHalted {
            task: run.task.clone(),
            stage,
            kind,
            message: message.clone(),
        });

        run.state = PipelineState::Halted;
        run.markers.push(StatusMarker::failure(
            stage.component(),
            format!("{} failed for {}: {}", stage, run.task, message),
        ));
        run.halt = Some(Halt {
            stage,
            kind,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;
    use crate::worker::{SelectorWorker, StageWorker};
    use async_trait::async_trait;
    use autoscribe_types::{ElementPropertyRecord, TargetElement};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned worker with an invocation counter.
    struct Canned {
        stage: Stage,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Canned {
        fn new(stage: Stage) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    stage,
                    calls: calls.clone(),
                    fail: false,
                },
                calls,
            )
        }

        fn failing(stage: Stage) -> (Self, Arc<AtomicUsize>) {
            let (mut worker, calls) = Self::new(stage);
            worker.fail = true;
            (worker, calls)
        }
    }

    #[async_trait]
    impl StageWorker for Canned {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn invoke(&self, _task: &TaskIdentity, input: StageInput) -> Result<StagePayload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(input.stage(), self.stage);
            if self.fail {
                return Err(AutoscribeError::WorkerFailure {
                    stage: self.stage,
                    message: "simulated crash".into(),
                });
            }
            Ok(match self.stage {
                Stage::Plan => StagePayload::Plan(PlanPayload {
                    title: Some("Login".into()),
                    initial_url: None,
                    steps: vec![],
                    elements: vec![TargetElement {
                        key_name: "loginButton".into(),
                        description: "Login".into(),
                    }],
                    outline: vec![],
                    page_objects: vec![],
                }),
                Stage::Trace => StagePayload::Trace(TracePayload {
                    elements: vec![ElementPropertyRecord::new("loginButton", "button")
                        .with_attribute("data-testid", "login")],
                    steps: vec![],
                }),
                Stage::DeriveSelectors => unreachable!("selector stage uses the builtin worker"),
                Stage::Emit => StagePayload::Emit(EmitManifest {
                    files: vec!["specs/login.spec.ts".into()],
                    notes: None,
                }),
            })
        }
    }

    fn request() -> TaskRequest {
        TaskRequest::new(
            TaskIdentity::new("S-1", "REG_001").unwrap(),
            "regression_test_cases.md",
        )
    }

    fn registry(fail_emit: bool) -> (WorkerRegistry, [Arc<AtomicUsize>; 3]) {
        let (plan, plan_calls) = Canned::new(Stage::Plan);
        let (trace, trace_calls) = Canned::new(Stage::Trace);
        let (emit, emit_calls) = if fail_emit {
            Canned::failing(Stage::Emit)
        } else {
            Canned::new(Stage::Emit)
        };
        let mut registry = WorkerRegistry::new();
        registry.register(plan);
        registry.register(trace);
        registry.register(SelectorWorker::default());
        registry.register(emit);
        (registry, [plan_calls, trace_calls, emit_calls])
    }

    #[test]
    fn incomplete_registry_is_rejected() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let mut workers = WorkerRegistry::new();
        workers.register(SelectorWorker::default());
        assert!(matches!(
            PipelineOrchestrator::new(store, workers),
            Err(AutoscribeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn fresh_run_invokes_every_stage_in_order() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let (workers, calls) = registry(false);
        let orchestrator = PipelineOrchestrator::new(store.clone(), workers).unwrap();

        let run = orchestrator.run(&request()).await;

        assert!(run.is_completed(), "halt: {:?}", run.halt);
        assert_eq!(run.invoked, Stage::ALL.to_vec());
        assert!(run.resumed.is_empty());
        assert_eq!(run.markers.len(), 4);
        assert!(run.markers.iter().all(StatusMarker::is_success));
        assert!(run.marker().is_success());
        assert_eq!(
            run.manifest.unwrap().files,
            vec![std::path::PathBuf::from("specs/login.spec.ts")]
        );
        for c in &calls {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }

        let selectors = store
            .read(&request().task, Stage::DeriveSelectors)
            .await
            .unwrap();
        assert_eq!(
            selectors.payload.as_selectors().unwrap().selectors[0].selector,
            "[data-testid='login']"
        );
    }

    #[tokio::test]
    async fn halt_keeps_earlier_artifacts_and_reports_stage() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let (workers, _) = registry(true);
        let orchestrator = PipelineOrchestrator::new(store.clone(), workers).unwrap();

        let run = orchestrator.run(&request()).await;

        assert_eq!(run.state, PipelineState::Halted);
        let halt = run.halt.clone().unwrap();
        assert_eq!(halt.stage, Stage::Emit);
        assert_eq!(halt.kind, FailureKind::WorkerFailure);
        assert!(halt.message.contains("simulated crash"));
        assert!(!run.marker().is_success());
        assert!(run.marker().to_string().contains("S-1/REG_001"));
        assert_eq!(
            store.completed_stages(&request().task).await.unwrap(),
            vec![Stage::Plan, Stage::Trace, Stage::DeriveSelectors]
        );
    }

    #[tokio::test]
    async fn missing_test_case_file_name_halts_at_plan() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let (workers, calls) = registry(false);
        let orchestrator = PipelineOrchestrator::new(store, workers).unwrap();

        let mut req = request();
        req.test_case_file_name = " ".into();
        let run = orchestrator.run(&req).await;

        let halt = run.halt.unwrap();
        assert_eq!(halt.stage, Stage::Plan);
        assert_eq!(halt.kind, FailureKind::MissingInput);
        assert_eq!(calls[0].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_identity_halts_before_any_stage() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let (workers, calls) = registry(false);
        let orchestrator = PipelineOrchestrator::new(store, workers).unwrap();

        let req = TaskRequest::new(
            TaskIdentity {
                story_id: "S-1".into(),
                test_id: String::new(),
            },
            "regression_test_cases.md",
        );
        let run = orchestrator.run(&req).await;

        assert_eq!(run.halt.unwrap().kind, FailureKind::MissingInput);
        assert!(calls.iter().all(|c| c.load(Ordering::SeqCst) == 0));
    }

    #[tokio::test]
    async fn events_follow_the_run() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let (workers, _) = registry(false);
        let events = EventEmitter::new(64);
        let mut rx = events.subscribe();
        let orchestrator = PipelineOrchestrator::new(store, workers)
            .unwrap()
            .with_events(events);

        orchestrator.run(&request()).await;

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let json = serde_json::to_value(&event).unwrap();
            names.push(json["event"].as_str().unwrap().to_string());
        }
        assert_eq!(names.first().map(String::as_str), Some("task_started"));
        assert_eq!(names.last().map(String::as_str), Some("task_completed"));
        assert_eq!(names.iter().filter(|n| *n == "artifact_written").count(), 4);
    }
}
