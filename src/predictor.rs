//! End-to-end prediction job
//!
//! [`Predictor::generate`] runs one job synchronously: resolve the API key,
//! assemble the payload (uploading media on the way), submit it, poll until
//! the remote task finishes, then classify the outputs. Every failure is
//! reported once as a [`PredictError`] naming the stage it happened in.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wavespeed_bridge::config::{ApiKeyProvider, PipelineConfig};
//! use wavespeed_bridge::predictor::{PredictRequest, Predictor};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let predictor = Predictor::from_config(PipelineConfig::default(), Arc::new(ApiKeyProvider::new()))?;
//! let prediction = predictor.generate(
//!     &PredictRequest::new("wavespeed-ai/flux-dev").with_input("prompt", "a lighthouse at dusk"),
//! )?;
//! println!("{}: {}", prediction.task_id, prediction.output);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::assemble::RequestAssembler;
use crate::config::{CredentialSource, PipelineConfig};
use crate::dispatch::{Dispatcher, HttpDispatcher};
use crate::encoder::MediaEncoder;
use crate::error::{PipelineError, PredictError, Result};
use crate::metrics::{Metrics, Timer};
use crate::output::{classify_outputs, select_primary, ClassifiedOutput, PrimaryOutput};
use crate::params::{parse_json_object, ConnectedInputs, InputValue, ParamSchema};
use crate::upload::{HttpUploadGateway, UploadGateway};
use crate::validation::require_model;

/// One generation request as configured by the caller.
#[derive(Debug, Clone, Default)]
pub struct PredictRequest {
    /// Model API path, e.g. `wavespeed-ai/flux-dev`.
    pub model_id: String,
    /// Base defaults as a JSON object string.
    pub request_json: String,
    /// Parameter metadata as a JSON object string.
    pub param_map: String,
    pub inputs: ConnectedInputs,
}

impl PredictRequest {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            request_json: "{}".to_string(),
            param_map: "{}".to_string(),
            inputs: ConnectedInputs::new(),
        }
    }

    pub fn with_request_json(mut self, request_json: impl Into<String>) -> Self {
        self.request_json = request_json.into();
        self
    }

    pub fn with_param_map(mut self, param_map: impl Into<String>) -> Self {
        self.param_map = param_map.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(name, value);
        self
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub task_id: String,
    pub status: String,
    /// The primary output as plain JSON.
    pub output: Value,
    #[serde(skip)]
    pub primary: PrimaryOutput,
    pub classified: ClassifiedOutput,
    pub latency_ms: u64,
}

pub struct Predictor {
    config: PipelineConfig,
    credentials: Arc<dyn CredentialSource>,
    encoder: MediaEncoder,
    gateway: Box<dyn UploadGateway>,
    dispatcher: Box<dyn Dispatcher>,
    metrics: Arc<Metrics>,
}

impl Predictor {
    pub fn new(
        config: PipelineConfig,
        credentials: Arc<dyn CredentialSource>,
        gateway: Box<dyn UploadGateway>,
        dispatcher: Box<dyn Dispatcher>,
    ) -> Self {
        Self {
            config,
            credentials,
            encoder: MediaEncoder::default(),
            gateway,
            dispatcher,
            metrics: Metrics::new(),
        }
    }

    /// HTTP gateway and dispatcher against `config.api_base`.
    pub fn from_config(config: PipelineConfig, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        let gateway = HttpUploadGateway::new(config.upload_url(), config.upload_timeout())?;
        let dispatcher = HttpDispatcher::new(config.api_base.clone(), config.request_timeout())?;
        Ok(Self::new(config, credentials, Box::new(gateway), Box::new(dispatcher)))
    }

    pub fn with_encoder(mut self, encoder: MediaEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn generate(&self, request: &PredictRequest) -> std::result::Result<Prediction, PredictError> {
        let timer = Timer::new();
        let result = self.run(request, &timer);
        let latency = timer.elapsed_ms();

        match result {
            Ok(prediction) => {
                self.metrics.record_prediction(None, latency);
                Ok(prediction)
            }
            Err(e) => {
                let err = PredictError::from(e);
                self.metrics.record_prediction(Some(err.stage), latency);
                error!("Prediction for '{}' failed: {}", request.model_id, err);
                Err(err)
            }
        }
    }

    fn run(&self, request: &PredictRequest, timer: &Timer) -> Result<Prediction> {
        let api_key = self.credentials.get().ok_or(PipelineError::NoCredential)?;
        let model = require_model(&request.model_id)?;

        let defaults = parse_json_object(&request.request_json, "request_json");
        let schema = ParamSchema::parse(&request.param_map);
        let payload = RequestAssembler::new(&self.encoder, self.gateway.as_ref())
            .with_metrics(&self.metrics)
            .assemble(&defaults, &request.inputs, &schema, &api_key)?;
        info!("Assembled {} parameters for {}", payload.len(), model);

        let task_id = self.dispatcher.submit(model, &payload, &api_key)?;
        let result = self.dispatcher.wait_for_completion(
            &task_id,
            &api_key,
            self.config.poll_interval(),
            self.config.dispatch_timeout(),
        )?;

        let primary = select_primary(&result.outputs).ok_or_else(|| PipelineError::NoOutputs {
            task_id: result.id.clone(),
        })?;
        let classified = classify_outputs(&result.id, &result.outputs);
        info!("Task {} finished with {} outputs", result.id, result.outputs.len());

        Ok(Prediction {
            task_id: result.id,
            status: result.status,
            output: primary.to_value(),
            primary,
            classified,
            latency_ms: timer.elapsed_ms(),
        })
    }
}
