//! Workers that delegate a stage to an external process or HTTP service.
//!
//! Both speak the same contract: a JSON [`WorkerRequest`] goes in, the stage
//! payload JSON comes out. The reply may end with a single status-marker line;
//! a failure marker turns the call into a `WorkerFailure` even when the
//! transport itself succeeded.

pub mod command;
pub mod http;

pub use command::CommandWorker;
pub use http::HttpWorker;

use autoscribe_types::{
    AutoscribeError, Result, Stage, StageInput, StagePayload, StatusMarker, TaskIdentity,
};
use serde::Serialize;

/// The request document handed to an external worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest<'a> {
    pub story_id: &'a str,
    pub test_id: &'a str,
    pub stage: Stage,
    pub input: &'a StageInput,
}

impl<'a> WorkerRequest<'a> {
    pub fn new(task: &'a TaskIdentity, stage: Stage, input: &'a StageInput) -> Self {
        Self {
            story_id: &task.story_id,
            test_id: &task.test_id,
            stage,
            input,
        }
    }
}

/// Decode a worker reply into the payload for `stage`.
pub(crate) fn decode_reply(stage: Stage, reply: &str) -> Result<StagePayload> {
    let mut body = reply.trim_end();

    if let Some((head, last)) = split_last_line(body) {
        if let Some(marker) = StatusMarker::parse(last) {
            if !marker.is_success() {
                return Err(AutoscribeError::WorkerFailure {
                    stage,
                    message: format!("{}: {}", marker.component, marker.message),
                });
            }
            tracing::debug!(stage = %stage, marker = %marker, "Worker reported success");
            body = head;
        }
    }

    if body.trim().is_empty() {
        return Err(AutoscribeError::WorkerFailure {
            stage,
            message: "worker returned no payload".into(),
        });
    }

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| AutoscribeError::WorkerFailure {
            stage,
            message: format!("malformed payload: {e}"),
        })?;
    StagePayload::decode(stage, value).map_err(|e| AutoscribeError::WorkerFailure {
        stage,
        message: format!("payload does not match the {stage} schema: {e}"),
    })
}

fn split_last_line(text: &str) -> Option<(&str, &str)> {
    match text.rfind('\n') {
        Some(i) => Some((&text[..i], &text[i + 1..])),
        None if !text.is_empty() => Some(("", text)),
        None => None,
    }
}

/// Keep log fields and error messages bounded.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
