//! Bulk job queue: runs many tasks through the orchestrator, one at a time,
//! with a bounded number of whole-task attempts each.
//!
//! A halted task is retried from its checkpoint while it has attempts left and
//! its failure kind allows it. Input, corruption and stage-mismatch failures
//! fail the job on the spot since a re-run cannot change their outcome.

use std::collections::VecDeque;
use std::path::PathBuf;

use autoscribe_types::{AutoscribeError, FailureKind, Result, Stage, StatusMarker, TaskIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cases::{discover_test_ids, TestCaseType};
use crate::config::AutoscribeConfig;
use crate::engine::{PipelineOrchestrator, TaskRequest};
use crate::events::PipelineEvent;
use crate::retry::BackoffPolicy;

const COMPONENT: &str = "BulkAutomation";

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One queued task and its attempt bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub request: TaskRequest,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub halted_stage: Option<Stage>,
    pub failure_kind: Option<FailureKind>,
}

impl Job {
    fn new(request: TaskRequest, max_attempts: u32) -> Self {
        Self {
            request,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            status: JobStatus::Pending,
            last_error: None,
            halted_stage: None,
            failure_kind: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub task: TaskIdentity,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl From<Job> for JobReport {
    fn from(job: Job) -> Self {
        Self {
            task: job.request.task,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            error: job.last_error,
            halted_stage: job.halted_stage,
            failure_kind: job.failure_kind,
        }
    }
}

/// Per-task outcome of a drained queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Succeeded)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    pub fn job(&self, task: &TaskIdentity) -> Option<&JobReport> {
        self.jobs.iter().find(|j| &j.task == task)
    }

    /// Terminal marker for the whole bulk run.
    pub fn marker(&self) -> StatusMarker {
        let total = self.jobs.len();
        if self.all_succeeded() {
            return StatusMarker::success(
                COMPONENT,
                format!("{}/{} test(s) automated", self.succeeded(), total),
            );
        }
        let failed: Vec<String> = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| match j.halted_stage {
                Some(stage) => format!("{} ({stage})", j.task.test_id),
                None => j.task.test_id.clone(),
            })
            .collect();
        StatusMarker::failure(
            COMPONENT,
            format!(
                "{} of {} test(s) failed: {}",
                failed.len(),
                total,
                failed.join(", ")
            ),
        )
    }
}

// ---------------------------------------------------------------------------
// BulkJobQueue
// ---------------------------------------------------------------------------

/// FIFO of tasks drained sequentially through one orchestrator.
pub struct BulkJobQueue<'a> {
    orchestrator: &'a PipelineOrchestrator,
    pending: VecDeque<Job>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl<'a> BulkJobQueue<'a> {
    pub fn new(orchestrator: &'a PipelineOrchestrator, max_attempts: u32) -> Self {
        Self {
            orchestrator,
            pending: VecDeque::new(),
            max_attempts: max_attempts.max(1),
            backoff: BackoffPolicy::None,
        }
    }

    /// Delay inserted before each retry of a halted task.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn enqueue(&mut self, request: TaskRequest) {
        self.pending.push_back(Job::new(request, self.max_attempts));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every queued job to `Succeeded` or `Failed` and report.
    pub async fn drain(mut self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(run_id = %run_id, jobs = self.pending.len(), "Draining bulk queue");

        let mut finished = Vec::with_capacity(self.pending.len());
        while let Some(job) = self.pending.pop_front() {
            finished.push(JobReport::from(self.process(job).await));
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            jobs: finished,
        };
        tracing::info!(
            run_id = %run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Bulk run finished"
        );
        self.emit(PipelineEvent::BulkFinished {
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        report
    }

    async fn process(&self, mut job: Job) -> Job {
        let task = job.request.task.clone();
        loop {
            job.status = JobStatus::Running;
            job.attempts += 1;
            tracing::info!(
                story = %task.story_id,
                test = %task.test_id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                "Running job"
            );

            let run = self.orchestrator.run(&job.request).await;
            let Some(halt) = run.halt else {
                job.status = JobStatus::Succeeded;
                job.last_error = None;
                job.halted_stage = None;
                job.failure_kind = None;
                break;
            };

            job.last_error = Some(halt.message);
            job.halted_stage = Some(halt.stage);
            job.failure_kind = Some(halt.kind);

            if !halt.kind.allows_task_retry() {
                tracing::warn!(
                    story = %task.story_id,
                    test = %task.test_id,
                    kind = %halt.kind,
                    "Failure cannot be fixed by a retry, failing job"
                );
                job.status = JobStatus::Failed;
                break;
            }
            if job.attempts >= job.max_attempts {
                tracing::warn!(
                    story = %task.story_id,
                    test = %task.test_id,
                    attempts = job.attempts,
                    "Attempts exhausted, failing job"
                );
                job.status = JobStatus::Failed;
                break;
            }

            self.emit(PipelineEvent::JobRetrying {
                task: task.clone(),
                attempt: job.attempts + 1,
                max_attempts: job.max_attempts,
            });
            let delay = self.backoff.delay_for_attempt((job.attempts - 1) as usize);
            if !delay.is_zero() {
                tracing::info!(
                    test = %task.test_id,
                    delay_ms = %delay.as_millis(),
                    "Waiting before retry"
                );
                tokio::time::sleep(delay).await;
            }
        }

        self.emit(PipelineEvent::JobFinished {
            task,
            status: job.status,
            attempts: job.attempts,
        });
        job
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = self.orchestrator.events() {
            events.emit(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Bulk request surface
// ---------------------------------------------------------------------------

/// A bulk automation request for one story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    pub story_id: String,
    pub test_case_type: TestCaseType,
    /// Empty means every id found in the story's test-case document.
    #[serde(default)]
    pub test_ids: Vec<String>,
    /// Retries after the first attempt.
    #[serde(default)]
    pub max_retries_per_test: Option<u32>,
}

/// Settings the bulk surface takes from configuration.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub manual_root: PathBuf,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl From<&AutoscribeConfig> for BulkOptions {
    fn from(config: &AutoscribeConfig) -> Self {
        Self {
            manual_root: config.manual_root.clone(),
            max_attempts: config.max_attempts,
            backoff: config.retry_backoff.clone(),
        }
    }
}

/// Resolve `request` into tasks, queue them, and drain.
pub async fn run_bulk(
    orchestrator: &PipelineOrchestrator,
    request: &BulkRequest,
    options: &BulkOptions,
) -> Result<RunReport> {
    if request.story_id.trim().is_empty() {
        return Err(AutoscribeError::MissingInput {
            field: "story_id".into(),
        });
    }

    let test_ids = if request.test_ids.is_empty() {
        discover_test_ids(&options.manual_root, &request.story_id, request.test_case_type).await?
    } else {
        request.test_ids.clone()
    };
    if test_ids.is_empty() {
        return Err(AutoscribeError::MissingInput {
            field: format!(
                "test ids ({} cases for story {})",
                request.test_case_type, request.story_id
            ),
        });
    }

    let max_attempts = request
        .max_retries_per_test
        .map(|r| r.saturating_add(1))
        .unwrap_or(options.max_attempts);
    let file_name = request.test_case_type.file_name();

    let mut queue =
        BulkJobQueue::new(orchestrator, max_attempts).with_backoff(options.backoff.clone());
    for test_id in test_ids {
        // Identity problems surface as a MissingInput halt on the job itself.
        let task = TaskIdentity {
            story_id: request.story_id.clone(),
            test_id,
        };
        queue.enqueue(TaskRequest::new(task, file_name.clone()));
    }

    Ok(queue.drain().await)
}
