use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use autoscribe_types::{AutoscribeError, Result, Stage, StageInput, StagePayload, TaskIdentity};
use tokio::io::AsyncWriteExt;

use super::{decode_reply, truncate, WorkerRequest};
use crate::worker::StageWorker;

// ---------------------------------------------------------------------------
// CommandWorker — runs a stage as a child process
// ---------------------------------------------------------------------------

/// Runs an external program per invocation. The [`WorkerRequest`] is written
/// to stdin as JSON; stdout must carry the stage payload.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    stage: Stage,
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    workdir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandWorker {
    pub fn new(stage: Stage, program: impl Into<String>) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            workdir: None,
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn failure(&self, message: String) -> AutoscribeError {
        AutoscribeError::WorkerFailure {
            stage: self.stage,
            message,
        }
    }
}

#[async_trait]
impl StageWorker for CommandWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn name(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, task: &TaskIdentity, input: StageInput) -> Result<StagePayload> {
        let request = serde_json::to_vec(&WorkerRequest::new(task, self.stage, &input))?;

        tracing::info!(
            task = %task,
            stage = %self.stage,
            program = %self.program,
            "Spawning worker process"
        );

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("AUTOSCRIBE_STORY_ID", &task.story_id)
            .env("AUTOSCRIBE_TEST_ID", &task.test_id)
            .env("AUTOSCRIBE_STAGE", self.stage.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.failure(format!("failed to spawn '{}': {e}", self.program)))?;

        // Fed concurrently so a chatty worker cannot deadlock on a full stdout pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let stage = self.stage;
            tokio::spawn(async move {
                // A worker that exits without reading its input is not an error by itself.
                if let Err(e) = stdin.write_all(&request).await {
                    tracing::debug!(stage = %stage, error = %e, "Worker closed stdin early");
                }
            });
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| AutoscribeError::WorkerTimeout {
                    stage: self.stage,
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| self.failure(format!("worker process failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::info!(
            task = %task,
            stage = %self.stage,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Worker process finished"
        );

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(self.failure(format!(
                "exit code {exit_code}: {}",
                truncate(detail, 500)
            )));
        }

        decode_reply(self.stage, &stdout)
    }
}
