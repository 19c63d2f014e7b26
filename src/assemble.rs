//! Request payload assembly
//!
//! [`RequestAssembler::assemble`] merges the base defaults, the connected
//! inputs and the indexed array members into one outbound payload:
//!
//! 1. media inputs are encoded and uploaded, each replaced by its URL
//! 2. indexed members (`image0`, `image_1`, ...) of every declared array
//!    parameter are ordered by index and folded into that parameter
//! 3. remaining connected inputs overlay the defaults
//! 4. empty values are dropped
//! 5. width/height pairs are checked
//!
//! Any failure except a single array member's upload aborts assembly, so a
//! partially valid payload is never returned.

use std::collections::HashSet;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::encoder::{forced_kind_for_field, EncodedMedia, MediaEncoder};
use crate::error::{PipelineError, Result};
use crate::metrics::Metrics;
use crate::params::{coerce_value, ConnectedInputs, InputValue, ParamSchema, ParameterDescriptor};
use crate::tensor::MediaKind;
use crate::upload::UploadGateway;
use crate::validation::{filter_empty, is_empty_value, validate_size_pairs};

const SOURCE_AUDIO_CONTENT_TYPE: &str = "audio/wav";

pub struct RequestAssembler<'a> {
    encoder: &'a MediaEncoder,
    gateway: &'a dyn UploadGateway,
    metrics: Option<&'a Metrics>,
}

/// A declared array parameter and the pattern its member fields follow.
struct ArrayParam<'s> {
    name: &'s str,
    descriptor: &'s ParameterDescriptor,
    members: Regex,
}

impl<'s> ArrayParam<'s> {
    fn new(name: &'s str, descriptor: &'s ParameterDescriptor) -> Result<Self> {
        let stem = name.strip_suffix('s').unwrap_or(name);
        let members = Regex::new(&format!(r"^{}_?(\d+)$", regex::escape(stem))).map_err(|e| {
            PipelineError::ValidationFailed(format!("invalid array parameter '{}': {}", name, e))
        })?;
        Ok(Self {
            name,
            descriptor,
            members,
        })
    }

    fn member_index(&self, field: &str) -> Option<u64> {
        let digits = self.members.captures(field)?.get(1)?.as_str();
        match digits.parse() {
            Ok(index) => Some(index),
            Err(_) => {
                warn!("Ignoring member '{}' of '{}': index {} is out of range", field, self.name, digits);
                None
            }
        }
    }
}

impl<'a> RequestAssembler<'a> {
    pub fn new(encoder: &'a MediaEncoder, gateway: &'a dyn UploadGateway) -> Self {
        Self {
            encoder,
            gateway,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: &'a Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn assemble(
        &self,
        base_defaults: &Map<String, Value>,
        inputs: &ConnectedInputs,
        schema: &ParamSchema,
        api_key: &str,
    ) -> Result<Map<String, Value>> {
        let arrays = schema
            .array_params()
            .map(|(name, descriptor)| ArrayParam::new(name, descriptor))
            .collect::<Result<Vec<_>>>()?;
        let member_fields: HashSet<&str> = inputs
            .iter()
            .map(|(field, _)| field)
            .filter(|field| arrays.iter().any(|array| array.members.is_match(field)))
            .collect();
        debug!(
            "Assembling {} inputs, {} array parameters, {} array members",
            inputs.len(),
            arrays.len(),
            member_fields.len()
        );

        let mut resolved = Vec::new();
        for (field, value) in inputs.iter() {
            if member_fields.contains(field) {
                continue;
            }
            if let Some(value) = self.resolve_input(field, value, schema, api_key)? {
                resolved.push((field, value));
            }
        }

        let mut payload = base_defaults.clone();
        for array in &arrays {
            if let Some(values) = self.reconstruct_array(array, inputs, api_key)? {
                info!("Merged array parameter '{}': {} items", array.name, values.len());
                payload.insert(array.name.to_string(), Value::Array(values));
            } else if payload.contains_key(array.name) {
                debug!("Using default value for '{}'", array.name);
            }
        }

        for (field, value) in resolved {
            if value.is_null() || value.as_str() == Some("") {
                continue;
            }
            payload.insert(field.to_string(), value);
        }

        let payload = filter_empty(payload);
        validate_size_pairs(&payload)?;
        Ok(payload)
    }

    /// Turn one non-member input into a payload value. `None` means the value
    /// cannot be sent and was dropped.
    fn resolve_input(
        &self,
        field: &str,
        value: &InputValue,
        schema: &ParamSchema,
        api_key: &str,
    ) -> Result<Option<Value>> {
        match value {
            InputValue::Json(json) => {
                let coerced = match schema.declared_type(field) {
                    Some(ty) if !is_empty_value(json) => coerce_value(json, ty),
                    _ => json.clone(),
                };
                Ok(Some(coerced))
            }
            media => match self.prepare_media(field, media)? {
                Some(encoded) => self.upload(field, encoded, api_key).map(|url| Some(Value::String(url))),
                None => Ok(None),
            },
        }
    }

    /// Collect the members of `array` in index order. `None` when no member
    /// produced a value, leaving any default in place. A member that fails to
    /// upload is skipped; a member that fails to encode aborts assembly.
    fn reconstruct_array(
        &self,
        array: &ArrayParam<'_>,
        inputs: &ConnectedInputs,
        api_key: &str,
    ) -> Result<Option<Vec<Value>>> {
        let mut members: Vec<(u64, &str, &InputValue)> = inputs
            .iter()
            .filter_map(|(field, value)| array.member_index(field).map(|index| (index, field, value)))
            .filter(|(_, field, value)| {
                if value.is_empty() {
                    debug!("Skipping empty array member '{}'", field);
                }
                !value.is_empty()
            })
            .collect();
        members.sort_by_key(|(index, _, _)| *index);

        let item_type = array.descriptor.item_type();
        let mut values = Vec::new();
        for (_, field, value) in members {
            match value {
                InputValue::Json(json) => match coerce_value(json, &item_type) {
                    Value::Array(items) => values.extend(items.into_iter().filter(|item| !is_empty_value(item))),
                    Value::Object(map) if map.is_empty() => {
                        debug!("Array member '{}' coerced to nothing", field);
                    }
                    coerced if is_empty_value(&coerced) => {
                        debug!("Array member '{}' coerced to nothing", field);
                    }
                    coerced => values.push(coerced),
                },
                media => {
                    let Some(encoded) = self.prepare_media(field, media)? else {
                        continue;
                    };
                    match self.upload(field, encoded, api_key) {
                        Ok(url) => values.push(Value::String(url)),
                        Err(e) => {
                            warn!("Skipping array member '{}' of '{}': {}", field, array.name, e);
                            if let Some(metrics) = self.metrics {
                                metrics.record_skipped_member();
                            }
                        }
                    }
                }
            }
        }

        if values.is_empty() {
            Ok(None)
        } else {
            Ok(Some(values))
        }
    }

    /// Bytes ready for upload. `None` for audio sources that cannot be sent.
    fn prepare_media(&self, field: &str, value: &InputValue) -> Result<Option<EncodedMedia>> {
        match value {
            InputValue::AudioSource(_) if !field.to_ascii_lowercase().contains("audio") => {
                warn!("Dropping audio source connected to non-audio field '{}'", field);
                Ok(None)
            }
            InputValue::AudioSource(source) => match source.as_ref()() {
                Ok(bytes) => Ok(Some(source_audio(bytes))),
                Err(e) => {
                    warn!("Audio source for '{}' produced no bytes: {}", field, e);
                    Ok(None)
                }
            },
            media => self.encode_media(field, media).map(Some),
        }
    }

    fn encode_media(&self, field: &str, value: &InputValue) -> Result<EncodedMedia> {
        match value {
            InputValue::Tensor(tensor) => self.encoder.encode(field, tensor, forced_kind_for_field(field)),
            InputValue::Audio(clip) => self.encoder.encode_audio_clip(field, clip),
            InputValue::Json(_) | InputValue::AudioSource(_) => Err(PipelineError::encode(
                field,
                MediaKind::Image,
                "value is not a media tensor",
            )),
        }
    }

    fn upload(&self, field: &str, media: EncodedMedia, api_key: &str) -> Result<String> {
        let size = media.bytes.len();
        info!("Uploading {} for '{}' ({} bytes)", media.kind, field, size);
        let result = self
            .gateway
            .upload(media.bytes, &media.filename, &media.content_type, api_key);
        if let Some(metrics) = self.metrics {
            metrics.record_upload(result.is_ok(), size);
        }
        result
    }
}

/// Wrap caller-produced audio bytes, sniffing their container when possible.
fn source_audio(bytes: Vec<u8>) -> EncodedMedia {
    let (content_type, extension) = match infer::get(&bytes) {
        Some(kind) if matches!(kind.matcher_type(), infer::MatcherType::Audio) => (kind.mime_type(), kind.extension()),
        _ => (SOURCE_AUDIO_CONTENT_TYPE, "wav"),
    };
    EncodedMedia {
        bytes,
        filename: format!("source_audio_upload.{}", extension),
        content_type: content_type.to_string(),
        kind: MediaKind::Audio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioClip;
    use crate::params::ParamType;
    use crate::tensor::MediaTensor;
    use crate::video::NoVideoBackend;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records uploads and fails for filenames or call numbers it is told to.
    #[derive(Default)]
    struct RecordingGateway {
        calls: Mutex<Vec<(String, String, usize)>>,
        fail_on_call: Option<usize>,
    }

    impl UploadGateway for RecordingGateway {
        fn upload(&self, bytes: Vec<u8>, filename: &str, content_type: &str, _api_key: &str) -> Result<String> {
            let mut calls = self.calls.lock().unwrap();
            let call = calls.len();
            calls.push((filename.to_string(), content_type.to_string(), bytes.len()));
            if self.fail_on_call == Some(call) {
                return Err(PipelineError::upload(502, "bad gateway"));
            }
            Ok(format!("https://cdn.test/{}/{}", call, filename))
        }
    }

    fn encoder() -> MediaEncoder {
        MediaEncoder::new(Box::new(NoVideoBackend), Box::new(crate::audio::HoundWavBackend))
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    fn images_schema() -> ParamSchema {
        ParamSchema::new().with("images", ParameterDescriptor::array(ParamType::String))
    }

    #[test]
    fn test_array_members_ordered_by_index() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let inputs = ConnectedInputs::new()
            .with("image1", "urlB")
            .with("image_0", "urlA");

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &images_schema(), "key")
            .unwrap();

        assert_eq!(Value::Object(payload), json!({"images": ["urlA", "urlB"]}));
    }

    #[test]
    fn test_width_height_pairing() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let assembler = RequestAssembler::new(&encoder, &gateway);
        let defaults = object(json!({"width": 512}));

        let inputs = ConnectedInputs::new().with("height", json!(512));
        let payload = assembler
            .assemble(&defaults, &inputs, &ParamSchema::new(), "key")
            .unwrap();
        assert_eq!(Value::Object(payload), json!({"width": 512, "height": 512}));

        let err = assembler
            .assemble(&defaults, &ConnectedInputs::new(), &ParamSchema::new(), "key")
            .unwrap_err();
        assert!(matches!(err, PipelineError::ValidationFailed(_)));
        assert!(err.to_string().contains("Size parameter ''"));
    }

    #[test]
    fn test_empty_values_filtered() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let defaults = object(json!({"prompt": "", "seed": 0, "tags": []}));

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&defaults, &ConnectedInputs::new(), &ParamSchema::new(), "key")
            .unwrap();
        assert_eq!(Value::Object(payload), json!({"seed": 0}));
    }

    #[test]
    fn test_connected_inputs_override_defaults_unless_empty() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let defaults = object(json!({"prompt": "default", "seed": 1, "guidance": 3.5}));
        let inputs = ConnectedInputs::new()
            .with("prompt", "")
            .with("seed", Value::Null)
            .with("guidance", json!("7.5"))
            .with("new_field", json!(true));
        let schema = ParamSchema::new().with("guidance", ParameterDescriptor::scalar(ParamType::Number));

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&defaults, &inputs, &schema, "key")
            .unwrap();
        assert_eq!(
            Value::Object(payload),
            json!({"prompt": "default", "seed": 1, "guidance": 7.5, "new_field": true})
        );
    }

    #[test]
    fn test_tensor_input_replaced_by_url() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let inputs = ConnectedInputs::new()
            .with("image", MediaTensor::zeros(&[1, 16, 16, 3]))
            .with("prompt", "a cat");

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &ParamSchema::new(), "key")
            .unwrap();

        assert_eq!(payload["image"], json!("https://cdn.test/0/tensor_upload.png"));
        let calls = gateway.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "image/png");
    }

    #[test]
    fn test_mask_field_forced_to_image() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        // would classify as a 24-frame video
        let inputs = ConnectedInputs::new().with("mask_image", MediaTensor::zeros(&[24, 8, 8, 1]));

        RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &ParamSchema::new(), "key")
            .unwrap();
        assert_eq!(gateway.calls.lock().unwrap()[0].0, "tensor_upload.png");
    }

    #[test]
    fn test_member_upload_failure_skipped() {
        let encoder = encoder();
        let gateway = RecordingGateway {
            fail_on_call: Some(0),
            ..Default::default()
        };
        let metrics = Metrics::default();
        let inputs = ConnectedInputs::new()
            .with("image_0", MediaTensor::zeros(&[8, 8, 3]))
            .with("image_1", MediaTensor::zeros(&[8, 8, 3]))
            .with("image_2", "https://x/c.png");

        let payload = RequestAssembler::new(&encoder, &gateway)
            .with_metrics(&metrics)
            .assemble(&Map::new(), &inputs, &images_schema(), "key")
            .unwrap();

        assert_eq!(
            payload["images"],
            json!(["https://cdn.test/1/tensor_upload.png", "https://x/c.png"])
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.uploads.failed, 1);
        assert_eq!(snapshot.uploads.skipped_array_members, 1);
    }

    #[test]
    fn test_non_member_upload_failure_is_fatal() {
        let encoder = encoder();
        let gateway = RecordingGateway {
            fail_on_call: Some(0),
            ..Default::default()
        };
        let inputs = ConnectedInputs::new().with("image", MediaTensor::zeros(&[8, 8, 3]));

        let err = RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &ParamSchema::new(), "key")
            .unwrap_err();
        assert!(matches!(err, PipelineError::UploadFailed { status: 502, .. }));
    }

    #[test]
    fn test_encode_failure_aborts_assembly() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let inputs = ConnectedInputs::new().with("image", MediaTensor::zeros(&[5, 5, 9]));

        let err = RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &ParamSchema::new(), "key")
            .unwrap_err();
        assert!(matches!(err, PipelineError::EncodeFailed { .. }));
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_members_keeps_default() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let defaults = object(json!({"images": ["https://x/default.png"]}));
        let inputs = ConnectedInputs::new().with("image_0", "");

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&defaults, &inputs, &images_schema(), "key")
            .unwrap();
        assert_eq!(payload["images"], json!(["https://x/default.png"]));
    }

    #[test]
    fn test_lora_members_flattened() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let schema = ParamSchema::new().with("loras", ParameterDescriptor::array(ParamType::LoraWeight));
        let inputs = ConnectedInputs::new()
            .with("lora_1", "detail:0.5")
            .with("lora_0", json!({"path": "style", "scale": 0.8}))
            .with("lora_2", "path1:abc");

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &schema, "key")
            .unwrap();
        assert_eq!(
            payload["loras"],
            json!([{"path": "style", "scale": 0.8}, {"path": "detail", "scale": 0.5}])
        );
        assert!(!payload.contains_key("lora_2"));
    }

    #[test]
    fn test_audio_clip_and_source_uploads() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let inputs = ConnectedInputs::new()
            .with("audio", AudioClip::new(MediaTensor::zeros(&[1, 1, 160]), 16_000))
            .with("driving_audio", InputValue::audio_source(|| Ok(b"RIFF\0\0\0\0WAVEfmt ".to_vec())))
            .with("prompt_source", InputValue::audio_source(|| Ok(vec![1, 2, 3])));

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &ParamSchema::new(), "key")
            .unwrap();

        assert_eq!(payload["audio"], json!("https://cdn.test/0/audio_upload.wav"));
        assert!(payload["driving_audio"].as_str().unwrap().ends_with(".wav"));
        assert!(!payload.contains_key("prompt_source"));
        let calls = gateway.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, content_type, _)| content_type.starts_with("audio/")));
    }

    #[test]
    fn test_member_encode_failure_aborts_assembly() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let metrics = Metrics::default();
        let inputs = ConnectedInputs::new()
            .with("image_0", MediaTensor::zeros(&[5, 5, 9]))
            .with("image_1", "https://x/b.png");

        let err = RequestAssembler::new(&encoder, &gateway)
            .with_metrics(&metrics)
            .assemble(&Map::new(), &inputs, &images_schema(), "key")
            .unwrap_err();

        assert!(matches!(err, PipelineError::EncodeFailed { ref field, .. } if field == "image_0"));
        assert!(gateway.calls.lock().unwrap().is_empty());
        assert_eq!(metrics.snapshot().uploads.skipped_array_members, 0);
    }

    #[test]
    fn test_out_of_range_member_index_ignored() {
        let encoder = encoder();
        let gateway = RecordingGateway::default();
        let inputs = ConnectedInputs::new()
            .with("image_99999999999999999999", MediaTensor::zeros(&[8, 8, 3]))
            .with("image_0", "https://x/a.png");

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &images_schema(), "key")
            .unwrap();

        assert_eq!(Value::Object(payload), json!({"images": ["https://x/a.png"]}));
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_video_tensor_uploaded_as_mp4() {
        if !crate::ffmpeg::is_ffmpeg_installed() {
            return;
        }
        let encoder = MediaEncoder::default();
        let gateway = RecordingGateway::default();
        let inputs = ConnectedInputs::new().with("video", MediaTensor::zeros(&[12, 16, 16, 3]));

        let payload = RequestAssembler::new(&encoder, &gateway)
            .assemble(&Map::new(), &inputs, &ParamSchema::new(), "key")
            .unwrap();

        assert_eq!(payload["video"], json!("https://cdn.test/0/tensor_upload.mp4"));
        let calls = gateway.calls.lock().unwrap();
        assert_eq!(calls[0].1, "video/mp4");
        assert!(calls[0].2 > 8);
    }
}
