//! Remote job submission and polling

use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Outcome of a finished remote job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub outputs: Vec<Value>,
}

/// Submits a payload to a model and waits for the job to finish.
pub trait Dispatcher: Send + Sync {
    /// Returns the remote task id.
    fn submit(&self, api_path: &str, payload: &Map<String, Value>, api_key: &str) -> Result<String>;

    fn wait_for_completion(
        &self,
        task_id: &str,
        api_key: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<TaskResult>;
}

/// Task state as reported by the prediction endpoints.
#[derive(Debug, Deserialize)]
struct TaskState {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    outputs: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpDispatcher {
    client: Client,
    api_base: String,
}

impl HttpDispatcher {
    pub fn new(api_base: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PipelineError::DispatchFailed(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Model paths are relative to `/api/v3/` unless they already name an
    /// `/api/` route.
    pub fn submit_url(&self, api_path: &str) -> String {
        if api_path.starts_with("/api/") {
            format!("{}{}", self.api_base, api_path)
        } else {
            format!("{}/api/v3/{}", self.api_base, api_path.trim_start_matches('/'))
        }
    }

    pub fn result_url(&self, task_id: &str) -> String {
        format!("{}/api/v3/predictions/{}/result", self.api_base, task_id)
    }

    fn fetch_state(&self, task_id: &str, api_key: &str) -> Result<TaskState> {
        let response = self
            .client
            .get(self.result_url(task_id))
            .bearer_auth(api_key)
            .send()
            .map_err(|e| PipelineError::DispatchFailed(format!("polling task {} failed: {}", task_id, e)))?;
        parse_task_state(response)
    }
}

impl Dispatcher for HttpDispatcher {
    fn submit(&self, api_path: &str, payload: &Map<String, Value>, api_key: &str) -> Result<String> {
        let url = self.submit_url(api_path);
        info!("Submitting task to {}", url);
        let body = Value::Object(payload.clone());
        debug!("Payload: {}", body);

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .map_err(|e| PipelineError::DispatchFailed(format!("submitting to {} failed: {}", url, e)))?;

        let state = parse_task_state(response)?;
        if state.id.is_empty() {
            return Err(PipelineError::DispatchFailed(
                "submission response carried no task id".to_string(),
            ));
        }
        info!("Task {} submitted ({})", state.id, state.status);
        Ok(state.id)
    }

    fn wait_for_completion(
        &self,
        task_id: &str,
        api_key: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let started = Instant::now();

        loop {
            let state = self.fetch_state(task_id, api_key)?;
            match state.status.as_str() {
                "completed" => {
                    info!("Task {} completed in {} ms", task_id, started.elapsed().as_millis());
                    return Ok(TaskResult {
                        id: if state.id.is_empty() { task_id.to_string() } else { state.id },
                        status: state.status,
                        outputs: state.outputs,
                    });
                }
                "failed" => {
                    let reason = state.error.filter(|e| !e.is_empty()).unwrap_or_else(|| "unknown error".to_string());
                    return Err(PipelineError::DispatchFailed(format!("Task {} failed: {}", task_id, reason)));
                }
                status => debug!("Task {} is {}", task_id, status),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(PipelineError::Timeout {
                    seconds: timeout.as_secs(),
                });
            }
            thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }
}

/// Read a prediction response, unwrapping the `{code, message, data}`
/// envelope when present.
fn parse_task_state(response: Response) -> Result<TaskState> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|e| PipelineError::DispatchFailed(format!("reading response failed: {}", e)))?;
    if !status.is_success() {
        return Err(PipelineError::DispatchFailed(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate(&body)
        )));
    }

    let value: Value = serde_json::from_str(&body)
        .map_err(|e| PipelineError::DispatchFailed(format!("invalid response JSON ({}): {}", e, truncate(&body))))?;
    let data = unwrap_envelope(value)?;
    serde_json::from_value(data).map_err(|e| PipelineError::DispatchFailed(format!("unexpected task shape: {}", e)))
}

pub fn unwrap_envelope(value: Value) -> Result<Value> {
    let Value::Object(mut map) = value else {
        return Ok(value);
    };
    if !map.contains_key("data") {
        return Ok(Value::Object(map));
    }
    if let Some(code) = map.get("code").and_then(Value::as_i64) {
        if code != 200 {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(PipelineError::DispatchFailed(format!("API error {}: {}", code, message)));
        }
    }
    Ok(map.remove("data").unwrap_or(Value::Null))
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 500;
    if body.chars().count() > LIMIT {
        format!("{}...", body.chars().take(LIMIT).collect::<String>())
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn dispatcher(server: &MockServer) -> HttpDispatcher {
        HttpDispatcher::new(server.base_url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_submit_urls() {
        let dispatcher = HttpDispatcher::new("https://api.test/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            dispatcher.submit_url("wavespeed-ai/flux-dev"),
            "https://api.test/api/v3/wavespeed-ai/flux-dev"
        );
        assert_eq!(dispatcher.submit_url("/api/v2/custom"), "https://api.test/api/v2/custom");
        assert_eq!(dispatcher.result_url("abc"), "https://api.test/api/v3/predictions/abc/result");
    }

    #[test]
    fn test_unwrap_envelope() {
        assert_eq!(unwrap_envelope(json!({"code": 200, "data": {"id": "x"}})).unwrap(), json!({"id": "x"}));
        assert_eq!(unwrap_envelope(json!({"id": "x"})).unwrap(), json!({"id": "x"}));
        let err = unwrap_envelope(json!({"code": 401, "message": "bad key", "data": null})).unwrap_err();
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn test_submit_posts_payload() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v3/wavespeed-ai/flux-dev")
                .header("Authorization", "Bearer key")
                .json_body(json!({"prompt": "a cat", "seed": 1}));
            then.status(200)
                .json_body(json!({"code": 200, "message": "success", "data": {"id": "task-1", "status": "created"}}));
        });

        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("a cat"));
        payload.insert("seed".into(), json!(1));
        let id = dispatcher(&server).submit("wavespeed-ai/flux-dev", &payload, "key").unwrap();

        mock.assert();
        assert_eq!(id, "task-1");
    }

    #[test]
    fn test_submit_http_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(500).body("boom");
        });

        let err = dispatcher(&server).submit("m", &Map::new(), "key").unwrap_err();
        assert!(matches!(err, PipelineError::DispatchFailed(_)));
        assert!(err.to_string().contains("HTTP 500: boom"));
    }

    #[test]
    fn test_wait_returns_completed_outputs() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/predictions/task-1/result");
            then.status(200).json_body(json!({
                "code": 200,
                "data": {"id": "task-1", "status": "completed", "outputs": ["https://x/a.png"]}
            }));
        });

        let result = dispatcher(&server)
            .wait_for_completion("task-1", "key", Duration::from_millis(10), Duration::from_secs(5))
            .unwrap();
        assert_eq!(result.status, "completed");
        assert_eq!(result.outputs, vec![json!("https://x/a.png")]);
    }

    #[test]
    fn test_wait_reports_failed_task() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET);
            then.status(200)
                .json_body(json!({"data": {"id": "t", "status": "failed", "error": "nsfw content"}, "code": 200}));
        });

        let err = dispatcher(&server)
            .wait_for_completion("t", "key", Duration::from_millis(10), Duration::from_secs(5))
            .unwrap_err();
        assert!(err.to_string().contains("nsfw content"));
    }

    #[test]
    fn test_wait_times_out() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET);
            then.status(200)
                .json_body(json!({"code": 200, "data": {"id": "t", "status": "processing"}}));
        });

        let err = dispatcher(&server)
            .wait_for_completion("t", "key", Duration::from_millis(20), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
        assert!(mock.hits() >= 2);
    }
}
