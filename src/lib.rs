//! wavespeed_bridge - media tensors in, typed generation results out
//!
//! Classifies untyped sample arrays as image, video or audio, encodes and
//! uploads them, assembles one request payload from scattered parameters,
//! runs the remote job and classifies its heterogeneous outputs.
//! Video encoding shells out to the system `ffmpeg` binary (no linking).

pub mod assemble;
pub mod audio;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod image;
pub mod metrics;
pub mod output;
pub mod params;
pub mod predictor;
pub mod tensor;
pub mod upload;
pub mod validation;
pub mod video;

pub use assemble::RequestAssembler;
pub use audio::AudioClip;
pub use config::{ApiKeyProvider, CredentialSource, PipelineConfig};
pub use dispatch::{Dispatcher, TaskResult};
pub use encoder::{EncodedMedia, MediaEncoder};
pub use error::{PipelineError, PredictError, Stage};
pub use output::{classify_outputs, select_primary, ClassifiedOutput, OutputKind, PrimaryOutput};
pub use params::{ConnectedInputs, InputValue, ParamSchema, ParamType, ParameterDescriptor};
pub use predictor::{PredictRequest, Prediction, Predictor};
pub use tensor::{classify, MediaKind, MediaTensor};
pub use upload::UploadGateway;

pub type Result<T> = std::result::Result<T, PipelineError>;
