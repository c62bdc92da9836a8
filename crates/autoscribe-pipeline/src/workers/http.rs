use std::time::Duration;

use async_trait::async_trait;
use autoscribe_types::{AutoscribeError, Result, Stage, StageInput, StagePayload, TaskIdentity};

use super::{decode_reply, truncate, WorkerRequest};
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::worker::StageWorker;

// ---------------------------------------------------------------------------
// HttpWorker — delegates a stage to a remote service
// ---------------------------------------------------------------------------

/// POSTs the [`WorkerRequest`] to `<endpoint>/<stage>` and decodes the reply
/// body. Connection errors, 429 and 5xx replies are retried with backoff.
#[derive(Debug, Clone)]
pub struct HttpWorker {
    stage: Stage,
    client: reqwest::Client,
    endpoint: String,
    max_retries: usize,
    backoff: BackoffPolicy,
    timeout: Option<Duration>,
}

impl HttpWorker {
    pub fn new(stage: Stage, endpoint: impl Into<String>) -> Self {
        Self {
            stage,
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_retries(mut self, max_retries: usize, backoff: BackoffPolicy) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.endpoint, self.stage.as_str())
    }

    async fn post_once(&self, url: &str, body: &serde_json::Value) -> Result<StagePayload> {
        let mut request = self.client.post(url).json(body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AutoscribeError::WorkerTimeout {
                    stage: self.stage,
                    timeout_ms: self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                }
            } else {
                AutoscribeError::Transport {
                    stage: self.stage,
                    message: e.to_string(),
                    transient: true,
                }
            }
        })?;

        let status = resp.status();
        let response_body = resp.text().await.map_err(|e| AutoscribeError::Transport {
            stage: self.stage,
            message: e.to_string(),
            transient: true,
        })?;

        if !status.is_success() {
            return Err(map_error(self.stage, status, &response_body));
        }

        decode_reply(self.stage, &response_body)
    }
}

#[async_trait]
impl StageWorker for HttpWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn invoke(&self, task: &TaskIdentity, input: StageInput) -> Result<StagePayload> {
        let body = serde_json::to_value(WorkerRequest::new(task, self.stage, &input))?;
        let url = self.url();
        tracing::info!(task = %task, stage = %self.stage, url = %url, "Calling remote worker");

        let (url, body) = (url.as_str(), &body);
        execute_with_retry(
            || self.post_once(url, body),
            self.max_retries,
            &self.backoff,
            self.stage,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(stage: Stage, status: reqwest::StatusCode, body: &str) -> AutoscribeError {
    let code = status.as_u16();
    let message = format!("HTTP {code}: {}", truncate(body, 500));
    match code {
        408 | 429 | 500..=599 => AutoscribeError::Transport {
            stage,
            message,
            transient: true,
        },
        _ => AutoscribeError::WorkerFailure { stage, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscribe_types::ElementPropertyRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn error_mapping_429_and_5xx_are_transient() {
        for status in [
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            let err = map_error(Stage::Trace, status, "busy");
            assert!(err.is_retryable(), "{status} should be retryable");
        }
    }

    #[test]
    fn error_mapping_4xx_is_worker_failure() {
        let err = map_error(Stage::Plan, reqwest::StatusCode::BAD_REQUEST, "no such test");
        match err {
            AutoscribeError::WorkerFailure { stage, message } => {
                assert_eq!(stage, Stage::Plan);
                assert_eq!(message, "HTTP 400: no such test");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn url_joins_endpoint_and_stage() {
        let worker = HttpWorker::new(Stage::DeriveSelectors, "http://localhost:9000/workers/");
        assert_eq!(worker.url(), "http://localhost:9000/workers/derive_selectors");
    }

    /// Serve canned replies, one per connection, in order.
    async fn serve(replies: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            for (status, body) in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_request(&mut socket).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (format!("http://{addr}"), hits)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + length {
                    return;
                }
            }
        }
    }

    fn selector_input() -> StageInput {
        StageInput::DeriveSelectors(vec![ElementPropertyRecord::new("ok", "button")])
    }

    fn task() -> TaskIdentity {
        TaskIdentity::new("S-3", "SMK_010").unwrap()
    }

    #[tokio::test]
    async fn transient_status_is_retried_until_success() {
        let (endpoint, hits) = serve(vec![
            (503, "warming up"),
            (
                200,
                r##"{"selectors": [{"keyName": "ok", "selector": "#ok", "strategyUsed": "ID", "confidence": "High"}]}"##,
            ),
        ])
        .await;

        let worker = HttpWorker::new(Stage::DeriveSelectors, endpoint)
            .with_retries(2, BackoffPolicy::None);
        let payload = worker.invoke(&task(), selector_input()).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(payload.as_selectors().unwrap().selectors[0].selector, "#ok");
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let (endpoint, hits) = serve(vec![(422, "bad input"), (200, "{}")]).await;

        let worker = HttpWorker::new(Stage::DeriveSelectors, endpoint)
            .with_retries(3, BackoffPolicy::None);
        let err = worker.invoke(&task(), selector_input()).await.unwrap_err();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(err, AutoscribeError::WorkerFailure { .. }));
    }
}
