//! Classification of remote job outputs
//!
//! Output items carry no type tag. URLs are recognised by extension
//! substrings, everything else is structured data or plain text. Two views
//! are offered: [`select_primary`] picks the one result handed back to the
//! caller, [`classify_outputs`] buckets every item for display.
//!
//! Whenever a 3-D model URL is present the task is a 3-D task. Its images are
//! previews only: the whole list is the primary result, and no image is
//! eligible for conversion back into a tensor.

use serde::Serialize;
use serde_json::Value;

pub const VIDEO_EXTENSIONS: [&str; 5] = [".mp4", ".mov", ".avi", ".mkv", ".webm"];
pub const IMAGE_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".gif", ".webp"];
pub const AUDIO_EXTENSIONS: [&str; 4] = [".mp3", ".wav", ".m4a", ".flac"];
pub const MODEL_3D_EXTENSIONS: [&str; 9] = [
    ".glb", ".gltf", ".obj", ".ply", ".fbx", ".stl", ".usdz", ".dae", ".3ds",
];

fn has_extension(url: &str, extensions: &[&str]) -> bool {
    let lower = url.to_lowercase();
    extensions.iter().any(|ext| lower.contains(ext))
}

fn item_has_extension(item: &Value, extensions: &[&str]) -> bool {
    item.as_str().map_or(false, |url| has_extension(url, extensions))
}

pub fn is_video_url(url: &str) -> bool {
    has_extension(url, &VIDEO_EXTENSIONS)
}

pub fn is_image_url(url: &str) -> bool {
    has_extension(url, &IMAGE_EXTENSIONS)
}

pub fn is_audio_url(url: &str) -> bool {
    has_extension(url, &AUDIO_EXTENSIONS)
}

pub fn is_model_3d_url(url: &str) -> bool {
    has_extension(url, &MODEL_3D_EXTENSIONS)
}

/// Kind of a single output URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Video,
    Image,
    Audio,
    Model3d,
    Text,
}

impl OutputKind {
    /// Video wins over image, image over audio, audio over 3-D; anything
    /// unrecognised is text.
    pub fn from_url(url: &str) -> Self {
        if is_video_url(url) {
            OutputKind::Video
        } else if is_image_url(url) {
            OutputKind::Image
        } else if is_audio_url(url) {
            OutputKind::Audio
        } else if is_model_3d_url(url) {
            OutputKind::Model3d
        } else {
            OutputKind::Text
        }
    }
}

/// The single result forwarded to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryOutput {
    Video(String),
    Image(String),
    Images(Vec<String>),
    Audio(String),
    Text(String),
    Data(Value),
    /// Full output list of a 3-D task.
    ModelBundle(Vec<Value>),
    /// A sole output item, forwarded without inspection.
    Passthrough(Value),
}

impl PrimaryOutput {
    pub fn to_value(&self) -> Value {
        match self {
            PrimaryOutput::Video(url)
            | PrimaryOutput::Image(url)
            | PrimaryOutput::Audio(url)
            | PrimaryOutput::Text(url) => Value::String(url.clone()),
            PrimaryOutput::Images(urls) => Value::Array(urls.iter().cloned().map(Value::String).collect()),
            PrimaryOutput::Data(value) | PrimaryOutput::Passthrough(value) => value.clone(),
            PrimaryOutput::ModelBundle(items) => Value::Array(items.clone()),
        }
    }
}

fn is_web_url(item: &Value) -> bool {
    item.as_str()
        .map_or(false, |s| s.starts_with("http://") || s.starts_with("https://"))
}

/// Pick the primary result: a sole item verbatim, a 3-D bundle whole, then
/// video, image(s), audio, the first non-URL item, and finally the first item.
pub fn select_primary(outputs: &[Value]) -> Option<PrimaryOutput> {
    match outputs {
        [] => return None,
        [only] => return Some(PrimaryOutput::Passthrough(only.clone())),
        _ => {}
    }

    if outputs.iter().any(|item| item_has_extension(item, &MODEL_3D_EXTENSIONS)) {
        return Some(PrimaryOutput::ModelBundle(outputs.to_vec()));
    }

    let urls = || outputs.iter().filter_map(Value::as_str);

    if let Some(video) = urls().find(|url| is_video_url(url)) {
        return Some(PrimaryOutput::Video(video.to_string()));
    }

    let mut images: Vec<String> = urls().filter(|url| is_image_url(url)).map(str::to_string).collect();
    match images.len() {
        0 => {}
        1 => return images.pop().map(PrimaryOutput::Image),
        _ => return Some(PrimaryOutput::Images(images)),
    }

    if let Some(audio) = urls().find(|url| is_audio_url(url)) {
        return Some(PrimaryOutput::Audio(audio.to_string()));
    }

    let first = outputs
        .iter()
        .find(|item| !is_web_url(item))
        .unwrap_or(&outputs[0]);
    Some(match first {
        Value::String(text) if !is_web_url(first) => PrimaryOutput::Text(text.clone()),
        Value::String(_) => PrimaryOutput::Passthrough(first.clone()),
        other => PrimaryOutput::Data(other.clone()),
    })
}

/// Every output item sorted into its display bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassifiedOutput {
    pub task_id: String,
    pub video_url: Option<String>,
    pub image_urls: Vec<String>,
    pub audio_url: Option<String>,
    pub text: Option<String>,
    pub model_3d_url: Option<String>,
    pub raw: Vec<Value>,
}

impl ClassifiedOutput {
    pub fn first_image_url(&self) -> Option<&str> {
        self.image_urls.first().map(String::as_str)
    }

    pub fn is_model_3d_task(&self) -> bool {
        self.model_3d_url.is_some()
    }

    /// Images that may be decoded back into a tensor. Previews of a 3-D task
    /// are excluded.
    pub fn images_for_tensor(&self) -> &[String] {
        if self.is_model_3d_task() {
            &[]
        } else {
            &self.image_urls
        }
    }
}

const NON_TEXT_SCHEMES: [&str; 4] = ["http://", "https://", "ftp://", "data:"];

/// Bucket every output. Only the first video, audio, 3-D and text item of
/// each kind is kept; all images are kept in order.
pub fn classify_outputs(task_id: &str, outputs: &[Value]) -> ClassifiedOutput {
    let mut classified = ClassifiedOutput {
        task_id: task_id.to_string(),
        raw: outputs.to_vec(),
        ..Default::default()
    };

    for item in outputs {
        match item {
            Value::String(url) => match OutputKind::from_url(url) {
                OutputKind::Video => {
                    classified.video_url.get_or_insert_with(|| url.clone());
                }
                OutputKind::Image => classified.image_urls.push(url.clone()),
                OutputKind::Audio => {
                    classified.audio_url.get_or_insert_with(|| url.clone());
                }
                OutputKind::Model3d => {
                    classified.model_3d_url.get_or_insert_with(|| url.clone());
                }
                OutputKind::Text => {
                    if !NON_TEXT_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                        classified.text.get_or_insert_with(|| url.clone());
                    }
                }
            },
            Value::Object(_) | Value::Array(_) => {
                if classified.text.is_none() {
                    classified.text = serde_json::to_string_pretty(item).ok();
                }
            }
            other => {
                classified.text.get_or_insert_with(|| other.to_string());
            }
        }
    }

    classified
}
