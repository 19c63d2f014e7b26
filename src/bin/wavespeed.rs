// wavespeed - run one generation job from the command line
// Loads media files into tensors, assembles the request and prints the classified result

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use ndarray::{Array, Array3, Axis};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wavespeed_bridge::config::{ApiKeyProvider, PipelineConfig};
use wavespeed_bridge::predictor::{PredictRequest, Predictor};
use wavespeed_bridge::{AudioClip, InputValue, MediaTensor};

#[derive(Parser)]
#[command(name = "wavespeed", version, about = "Run a WaveSpeed generation job with tensor inputs")]
struct Args {
    /// Model API path, e.g. wavespeed-ai/flux-dev
    #[arg(long)]
    model: Option<String>,

    /// Base request parameters as a JSON object
    #[arg(long, default_value = "{}")]
    request_json: String,

    /// Parameter metadata as a JSON object
    #[arg(long, default_value = "{}")]
    param_map: String,

    /// Connected input NAME=VALUE; VALUE is parsed as JSON when possible
    #[arg(long = "input", value_name = "NAME=VALUE")]
    inputs: Vec<String>,

    /// Image file loaded as a tensor, NAME=PATH
    #[arg(long = "image", value_name = "NAME=PATH")]
    images: Vec<String>,

    /// WAV file loaded as a waveform, NAME=PATH
    #[arg(long = "audio", value_name = "NAME=PATH")]
    audio: Vec<String>,

    /// API key for this run only
    #[arg(long)]
    api_key: Option<String>,

    /// Persist an API key to the config file and exit
    #[arg(long, value_name = "KEY")]
    save_api_key: Option<String>,

    /// Remove the persisted API key and exit
    #[arg(long)]
    delete_api_key: bool,

    /// Config file holding the persisted API key
    #[arg(long, env = "WAVESPEED_CONFIG")]
    config: Option<PathBuf>,

    /// API base URL
    #[arg(long, env = "WAVESPEED_API_BASE", default_value = wavespeed_bridge::config::DEFAULT_API_BASE)]
    api_base: String,

    /// Seconds between status polls
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,

    /// Seconds to wait for the task to finish
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Print pipeline metrics after the run
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut provider = ApiKeyProvider::new();
    if let Some(path) = &args.config {
        provider = provider.with_config_path(path);
    }

    if let Some(key) = &args.save_api_key {
        let path = provider.save_api_key(key).context("Failed to save API key")?;
        println!("API key saved to {}", path.display());
        return Ok(());
    }
    if args.delete_api_key {
        if provider.delete_api_key().context("Failed to delete API key")? {
            println!("API key removed");
        } else {
            println!("No persisted API key found");
        }
        return Ok(());
    }
    if let Some(key) = &args.api_key {
        provider.set_runtime_key(key);
    }

    let mut request = PredictRequest::new(args.model.clone().unwrap_or_default())
        .with_request_json(args.request_json.clone())
        .with_param_map(args.param_map.clone());
    for spec in &args.inputs {
        let (name, raw) = split_assignment(spec)?;
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        request.inputs.insert(name, InputValue::Json(value));
    }
    for spec in &args.images {
        let (name, path) = split_assignment(spec)?;
        let tensor = load_image_tensor(Path::new(path))?;
        info!("Loaded {} as tensor {:?} ({})", path, tensor.shape(), tensor.kind());
        request.inputs.insert(name, tensor);
    }
    for spec in &args.audio {
        let (name, path) = split_assignment(spec)?;
        let clip = load_wav_clip(Path::new(path))?;
        info!("Loaded {} as waveform {:?} at {} Hz", path, clip.waveform.shape(), clip.sample_rate);
        request.inputs.insert(name, clip);
    }

    let config = PipelineConfig::default()
        .with_api_base(args.api_base.clone())
        .with_poll_interval(args.poll_interval)
        .with_dispatch_timeout(args.timeout);
    let predictor = Predictor::from_config(config, Arc::new(provider)).context("Failed to build pipeline")?;

    let outcome = predictor.generate(&request);
    if args.metrics {
        eprintln!("{}", serde_json::to_string_pretty(&predictor.metrics().snapshot())?);
    }
    let prediction = outcome?;
    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}

fn split_assignment(spec: &str) -> Result<(&str, &str)> {
    spec.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{}'", spec))
}

/// Decode an image file into a `[1, H, W, C]` tensor normalized to `0..=1`.
fn load_image_tensor(path: &Path) -> Result<MediaTensor> {
    let decoded = image::open(path).with_context(|| format!("Failed to open image {}", path.display()))?;
    let (width, height) = (decoded.width() as usize, decoded.height() as usize);
    let (channels, raw) = if decoded.color().has_alpha() {
        (4, decoded.to_rgba8().into_raw())
    } else {
        (3, decoded.to_rgb8().into_raw())
    };

    let pixels: Vec<f32> = raw.into_iter().map(|v| v as f32 / 255.0).collect();
    let frame = Array3::from_shape_vec((height, width, channels), pixels)
        .context("Decoded image does not match its dimensions")?;
    Ok(MediaTensor::new(frame.insert_axis(Axis(0)).into_dyn()))
}

/// Read a WAV file into a `[1, C, T]` waveform in `-1..=1`.
fn load_wav_clip(path: &Path) -> Result<AudioClip> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("Failed to open WAV {}", path.display()))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .context("Failed to read WAV samples")?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .context("Failed to read WAV samples")?
        }
    };

    let channels = spec.channels.max(1) as usize;
    if samples.len() % channels != 0 {
        warn!("{} has a trailing partial frame", path.display());
    }
    let frames = samples.len() / channels;
    if frames == 0 {
        bail!("{} contains no samples", path.display());
    }

    // interleaved [T, C] to [1, C, T]
    let interleaved = Array::from_shape_vec((frames, channels), samples[..frames * channels].to_vec())
        .context("Failed to shape WAV samples")?;
    let waveform = interleaved.reversed_axes().insert_axis(Axis(0));
    Ok(AudioClip::new(
        MediaTensor::new(waveform.as_standard_layout().into_owned().into_dyn()),
        spec.sample_rate,
    ))
}
