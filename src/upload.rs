//! Media upload gateway
//!
//! Uploads are a single multipart `file` part sent with bearer auth. The
//! gateway answers with either a bare URL string, an object carrying
//! `download_url`/`url`, or the same fields nested under `data`; the first of
//! those that is present and non-empty wins.

use std::time::Duration;

use reqwest::blocking::{multipart, Client};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Accepts encoded bytes and returns a public URL for them.
pub trait UploadGateway: Send + Sync {
    fn upload(&self, bytes: Vec<u8>, filename: &str, content_type: &str, api_key: &str) -> Result<String>;
}

pub struct HttpUploadGateway {
    client: Client,
    endpoint: String,
}

impl HttpUploadGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::upload(0, &format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl UploadGateway for HttpUploadGateway {
    fn upload(&self, bytes: Vec<u8>, filename: &str, content_type: &str, api_key: &str) -> Result<String> {
        info!("Uploading {} ({} bytes) to {}", filename, bytes.len(), self.endpoint);

        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|e| PipelineError::upload(0, &format!("invalid content type '{}': {}", content_type, e)))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .map_err(|e| PipelineError::upload(e.status().map_or(0, |s| s.as_u16()), &e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| PipelineError::upload(status, &e.to_string()))?;
        if status != 200 {
            return Err(PipelineError::upload(status, &body));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|_| PipelineError::upload(status, &body))?;
        let url = extract_upload_url(&parsed)
            .ok_or_else(|| PipelineError::upload(status, &format!("Upload API returned no URL: {}", body)))?;
        debug!("Uploaded {} -> {}", filename, url);
        Ok(url)
    }
}

/// Pull the public URL out of an upload response.
pub fn extract_upload_url(response: &Value) -> Option<String> {
    fn non_empty(value: Option<&Value>) -> Option<String> {
        value
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    match response {
        Value::String(url) => Some(url.clone()),
        Value::Object(map) => non_empty(map.get("download_url"))
            .or_else(|| non_empty(map.get("url")))
            .or_else(|| {
                let data = map.get("data")?.as_object()?;
                non_empty(data.get("download_url")).or_else(|| non_empty(data.get("url")))
            }),
        _ => None,
    }
}
