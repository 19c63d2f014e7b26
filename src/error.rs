use std::fmt;

use thiserror::Error;

use crate::tensor::MediaKind;

/// Maximum number of response-body characters kept in an upload error.
const MAX_ERROR_BODY: usize = 500;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to encode {kind} for '{field}': {reason}")]
    EncodeFailed {
        field: String,
        kind: MediaKind,
        reason: String,
    },

    #[error("Upload failed with status {status}: {body}")]
    UploadFailed { status: u16, body: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("No API key configured. Set it with `wavespeed --save-api-key <KEY>`, in the config file, or via the WAVESPEED_API_KEY environment variable. Keys are available at https://wavespeed.ai")]
    NoCredential,

    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Task did not complete within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Task {task_id} completed without outputs")]
    NoOutputs { task_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn encode(field: impl Into<String>, kind: MediaKind, reason: impl fmt::Display) -> Self {
        PipelineError::EncodeFailed {
            field: field.into(),
            kind,
            reason: reason.to_string(),
        }
    }

    /// Builds an upload error, truncating the body so logs stay readable.
    pub fn upload(status: u16, body: &str) -> Self {
        let body = if body.chars().count() > MAX_ERROR_BODY {
            let mut truncated: String = body.chars().take(MAX_ERROR_BODY).collect();
            truncated.push_str("...");
            truncated
        } else {
            body.to_string()
        };
        PipelineError::UploadFailed { status, body }
    }

    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::EncodeFailed { .. }
            | PipelineError::ValidationFailed(_)
            | PipelineError::NoCredential
            | PipelineError::Json(_) => Stage::Assembly,
            PipelineError::UploadFailed { .. } | PipelineError::Io(_) => Stage::Upload,
            PipelineError::DispatchFailed(_) | PipelineError::Timeout { .. } => Stage::Dispatch,
            PipelineError::NoOutputs { .. } => Stage::Classification,
        }
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Assembly,
    Upload,
    Dispatch,
    Classification,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Assembly => "assembly",
            Stage::Upload => "upload",
            Stage::Dispatch => "dispatch",
            Stage::Classification => "classification",
        })
    }
}

/// The one failure surfaced to callers of a prediction.
#[derive(Error, Debug)]
#[error("prediction failed during {stage}: {source}")]
pub struct PredictError {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

impl From<PipelineError> for PredictError {
    fn from(source: PipelineError) -> Self {
        Self {
            stage: source.stage(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
