//! Connected inputs, parameter schema and value coercion
//!
//! The parameter schema is an open map: every field name a model declares is
//! accepted, and any field it does not declare falls back to a passthrough
//! descriptor. Unknown keys are never rejected, only filtered later if empty.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::audio::AudioClip;
use crate::tensor::MediaTensor;

/// Failure reported by an [`AudioSourceFn`].
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Callable producing encoded audio bytes on demand.
pub type AudioSourceFn = Arc<dyn Fn() -> Result<Vec<u8>, SourceError> + Send + Sync>;

/// Value connected to a request field.
#[derive(Clone)]
pub enum InputValue {
    Json(Value),
    Tensor(MediaTensor),
    Audio(AudioClip),
    AudioSource(AudioSourceFn),
}

impl InputValue {
    pub fn audio_source<F>(source: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>, SourceError> + Send + Sync + 'static,
    {
        InputValue::AudioSource(Arc::new(source))
    }

    /// Null and empty-string values never override or join anything.
    pub fn is_empty(&self) -> bool {
        match self {
            InputValue::Json(Value::Null) => true,
            InputValue::Json(Value::String(s)) => s.is_empty(),
            _ => false,
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, InputValue::Json(_))
    }
}

impl fmt::Debug for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::Json(value) => f.debug_tuple("Json").field(value).finish(),
            InputValue::Tensor(tensor) => f.debug_tuple("Tensor").field(&tensor.shape()).finish(),
            InputValue::Audio(clip) => f
                .debug_struct("Audio")
                .field("shape", &clip.waveform.shape())
                .field("sample_rate", &clip.sample_rate)
                .finish(),
            InputValue::AudioSource(_) => f.write_str("AudioSource(..)"),
        }
    }
}

impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        InputValue::Json(value)
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        InputValue::Json(Value::String(value.to_string()))
    }
}

impl From<MediaTensor> for InputValue {
    fn from(tensor: MediaTensor) -> Self {
        InputValue::Tensor(tensor)
    }
}

impl From<AudioClip> for InputValue {
    fn from(clip: AudioClip) -> Self {
        InputValue::Audio(clip)
    }
}

/// Connected inputs in connection order. Inserting an existing name replaces
/// its value in place.
#[derive(Debug, Clone, Default)]
pub struct ConnectedInputs {
    entries: Vec<(String, InputValue)>,
}

impl ConnectedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<InputValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&InputValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InputValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<InputValue>> FromIterator<(K, V)> for ConnectedInputs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut inputs = ConnectedInputs::new();
        for (name, value) in iter {
            inputs.insert(name, value);
        }
        inputs
    }
}

/// Declared type of a request field or array item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParamType {
    String,
    Number,
    ArrayStr,
    ArrayInt,
    LoraWeight,
    Other(String),
}

impl ParamType {
    pub fn as_str(&self) -> &str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::ArrayStr => "array-str",
            ParamType::ArrayInt => "array-int",
            ParamType::LoraWeight => "lora-weight",
            ParamType::Other(name) => name,
        }
    }
}

impl From<String> for ParamType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "string" => ParamType::String,
            "number" => ParamType::Number,
            "array-str" => ParamType::ArrayStr,
            "array-int" => ParamType::ArrayInt,
            "lora-weight" => ParamType::LoraWeight,
            _ => ParamType::Other(name),
        }
    }
}

impl From<ParamType> for String {
    fn from(ty: ParamType) -> Self {
        ty.as_str().to_string()
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one logical request field is structured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDescriptor {
    #[serde(default)]
    pub is_array: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<ParamType>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<ParamType>,
}

impl ParameterDescriptor {
    pub fn array(item_type: ParamType) -> Self {
        Self {
            is_array: true,
            item_type: Some(item_type),
            param_type: None,
        }
    }

    pub fn scalar(param_type: ParamType) -> Self {
        Self {
            is_array: false,
            item_type: None,
            param_type: Some(param_type),
        }
    }

    /// Array items default to strings.
    pub fn item_type(&self) -> ParamType {
        self.item_type.clone().unwrap_or(ParamType::String)
    }
}

/// Parameter metadata keyed by field name, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    entries: Vec<(String, ParameterDescriptor)>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `param_map` JSON. Malformed input yields an empty schema.
    pub fn parse(raw: &str) -> Self {
        Self::from_value(&Value::Object(parse_json_object(raw, "param_map")))
    }

    /// Entries that are not descriptor objects are ignored.
    pub fn from_value(value: &Value) -> Self {
        let mut schema = Self::new();
        if let Some(map) = value.as_object() {
            for (name, raw) in map {
                match ParameterDescriptor::deserialize(raw) {
                    Ok(descriptor) => schema.insert(name.clone(), descriptor),
                    Err(e) => debug!("Ignoring parameter metadata for '{}': {}", name, e),
                }
            }
        }
        schema
    }

    pub fn insert(&mut self, name: impl Into<String>, descriptor: ParameterDescriptor) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = descriptor,
            None => self.entries.push((name, descriptor)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, descriptor: ParameterDescriptor) -> Self {
        self.insert(name, descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDescriptor> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, descriptor)| descriptor)
    }

    /// Declared type of a scalar field, if any.
    pub fn declared_type(&self, name: &str) -> Option<&ParamType> {
        self.get(name).and_then(|d| d.param_type.as_ref())
    }

    pub fn array_params(&self) -> impl Iterator<Item = (&str, &ParameterDescriptor)> {
        self.entries
            .iter()
            .filter(|(_, descriptor)| descriptor.is_array)
            .map(|(name, descriptor)| (name.as_str(), descriptor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a JSON object string, treating blank or malformed input as `{}`.
pub fn parse_json_object(raw: &str, what: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!("{} is not a JSON object ({}), using {{}}", what, type_name(&other));
            Map::new()
        }
        Err(e) => {
            warn!("{} is not valid JSON ({}), using {{}}", what, e);
            Map::new()
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Plain-text rendering of a value: strings unquoted, null empty.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerce a connected value to the declared parameter type.
pub fn coerce_value(value: &Value, ty: &ParamType) -> Value {
    let coerced = match ty {
        ParamType::ArrayStr => Value::Array(to_string_list(value)),
        ParamType::ArrayInt => Value::Array(to_number_list(value)),
        ParamType::LoraWeight => to_lora(value),
        ParamType::Number => to_number(value),
        ParamType::String | ParamType::Other(_) => Value::String(value_to_string(value)),
    };
    debug!("Coerced {} as {} -> {}", value, ty, coerced);
    coerced
}

fn to_string_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.iter().map(|item| Value::String(value_to_string(item))).collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| Value::String(item.to_string()))
            .collect(),
        other => vec![Value::String(value_to_string(other))],
    }
}

fn to_number_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Number(_) => item.clone(),
                Value::String(s) => parse_number(s).unwrap_or_else(|| item.clone()),
                other => Value::String(value_to_string(other)),
            })
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse_number(item).unwrap_or_else(|| Value::String(item.to_string())))
            .collect(),
        Value::Number(_) => vec![value.clone()],
        other => vec![Value::String(value_to_string(other))],
    }
}

fn to_number(value: &Value) -> Value {
    match value {
        Value::String(s) => parse_number(s).unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn is_lora_entry(value: &Value) -> bool {
    value
        .as_object()
        .map_or(false, |map| map.contains_key("path") && map.contains_key("scale"))
}

fn valid_lora_entries(items: &[Value]) -> Vec<Value> {
    items
        .iter()
        .filter(|item| {
            let valid = is_lora_entry(item);
            if !valid {
                warn!("Skipping LoRA entry without path and scale: {}", item);
            }
            valid
        })
        .cloned()
        .collect()
}

fn to_lora(value: &Value) -> Value {
    match value {
        Value::Object(_) if is_lora_entry(value) => value.clone(),
        Value::Object(_) => {
            warn!("LoRA object missing path or scale: {}", value);
            Value::Object(Map::new())
        }
        Value::Array(items) => Value::Array(valid_lora_entries(items)),
        Value::String(s) => lora_from_str(s),
        _ => Value::Object(Map::new()),
    }
}

fn lora_from_str(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(parsed) if is_lora_entry(&parsed) => parsed,
            Ok(parsed) => {
                warn!("LoRA object missing path or scale: {}", parsed);
                Value::Object(Map::new())
            }
            Err(e) => {
                warn!("Failed to parse LoRA JSON object: {}", e);
                Value::Object(Map::new())
            }
        };
    }
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => Value::Array(valid_lora_entries(&items)),
            Ok(_) | Err(_) => {
                warn!("Failed to parse LoRA JSON array: {}", trimmed);
                Value::Array(Vec::new())
            }
        };
    }

    let loras = trimmed
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter_map(parse_lora_pair)
        .collect();
    Value::Array(loras)
}

/// `path:scale`, or a bare path at scale 1.0. A URL scheme colon is part of
/// the path.
fn parse_lora_pair(pair: &str) -> Option<Value> {
    let (path, scale) = match pair.rsplit_once(':') {
        None => (pair, 1.0),
        Some((_, tail)) if tail.starts_with("//") => (pair, 1.0),
        Some((path, tail)) => match tail.trim().parse::<f64>() {
            Ok(scale) if scale.is_finite() => (path.trim(), scale),
            _ => {
                warn!("Invalid scale value in LoRA pair: {}", pair);
                return None;
            }
        },
    };
    let mut entry = Map::new();
    entry.insert("path".to_string(), Value::String(path.to_string()));
    entry.insert("scale".to_string(), Number::from_f64(scale).map_or(Value::Null, Value::Number));
    Some(Value::Object(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_parses_descriptors_in_order() {
        let schema = ParamSchema::parse(
            r#"{"images": {"isArray": true, "itemType": "string"},
                "seed": {"type": "number"},
                "loras": {"isArray": true, "itemType": "lora-weight"},
                "broken": 42}"#,
        );
        assert_eq!(schema.len(), 3);
        let arrays: Vec<&str> = schema.array_params().map(|(name, _)| name).collect();
        assert_eq!(arrays, vec!["images", "loras"]);
        assert_eq!(schema.declared_type("seed"), Some(&ParamType::Number));
        assert_eq!(schema.get("loras").unwrap().item_type(), ParamType::LoraWeight);
        assert!(schema.get("prompt").is_none());
    }

    #[test]
    fn test_malformed_schema_is_empty() {
        assert!(ParamSchema::parse("{not json").is_empty());
        assert!(ParamSchema::parse("[1, 2]").is_empty());
        assert!(ParamSchema::parse("").is_empty());
    }

    #[test]
    fn test_item_type_defaults_to_string() {
        let descriptor: ParameterDescriptor = serde_json::from_value(json!({"isArray": true})).unwrap();
        assert_eq!(descriptor.item_type(), ParamType::String);
        assert_eq!(
            serde_json::to_value(ParameterDescriptor::array(ParamType::ArrayInt)).unwrap(),
            json!({"isArray": true, "itemType": "array-int"})
        );
    }

    #[test]
    fn test_connected_inputs_replace_in_place() {
        let inputs = ConnectedInputs::new()
            .with("prompt", "a cat")
            .with("seed", json!(1))
            .with("prompt", "a dog");
        let names: Vec<&str> = inputs.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["prompt", "seed"]);
        assert!(matches!(inputs.get("prompt"), Some(InputValue::Json(Value::String(s))) if s == "a dog"));
    }

    #[test]
    fn test_empty_input_values() {
        assert!(InputValue::from(Value::Null).is_empty());
        assert!(InputValue::from("").is_empty());
        assert!(!InputValue::from(json!(0)).is_empty());
        assert!(!InputValue::from(MediaTensor::zeros(&[4])).is_empty());
    }

    #[test]
    fn test_array_str_coercion() {
        assert_eq!(coerce_value(&json!(" a, b ,,c "), &ParamType::ArrayStr), json!(["a", "b", "c"]));
        assert_eq!(coerce_value(&json!([1, "x", true]), &ParamType::ArrayStr), json!(["1", "x", "true"]));
        assert_eq!(coerce_value(&json!(7), &ParamType::ArrayStr), json!(["7"]));
    }

    #[test]
    fn test_array_int_coercion_falls_back_to_string() {
        assert_eq!(coerce_value(&json!("1, 2.5, x"), &ParamType::ArrayInt), json!([1.0, 2.5, "x"]));
        assert_eq!(coerce_value(&json!([3, "4", "y"]), &ParamType::ArrayInt), json!([3, 4.0, "y"]));
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(coerce_value(&json!("1.5"), &ParamType::Number), json!(1.5));
        assert_eq!(coerce_value(&json!(3), &ParamType::Number), json!(3));
        assert_eq!(coerce_value(&json!("abc"), &ParamType::Number), json!("abc"));
    }

    #[test]
    fn test_other_types_stringify() {
        assert_eq!(coerce_value(&Value::Null, &ParamType::String), json!(""));
        assert_eq!(coerce_value(&json!(12), &ParamType::String), json!("12"));
        assert_eq!(coerce_value(&json!(true), &ParamType::Other("enum".into())), json!("true"));
    }

    #[test]
    fn test_lora_objects_and_lists() {
        let single = json!({"path": "a.safetensors", "scale": 0.7});
        assert_eq!(coerce_value(&single, &ParamType::LoraWeight), single);
        assert_eq!(coerce_value(&json!({"path": "a"}), &ParamType::LoraWeight), json!({}));
        assert_eq!(
            coerce_value(&json!([{"path": "a", "scale": 1}, {"scale": 2}]), &ParamType::LoraWeight),
            json!([{"path": "a", "scale": 1}])
        );
    }

    #[test]
    fn test_lora_json_strings() {
        assert_eq!(
            coerce_value(&json!(r#"{"path": "a", "scale": 0.5}"#), &ParamType::LoraWeight),
            json!({"path": "a", "scale": 0.5})
        );
        assert_eq!(
            coerce_value(&json!(r#"[{"path": "a", "scale": 1}, {"path": "b"}]"#), &ParamType::LoraWeight),
            json!([{"path": "a", "scale": 1}])
        );
        assert_eq!(coerce_value(&json!("{oops}"), &ParamType::LoraWeight), json!({}));
    }

    #[test]
    fn test_lora_shorthand() {
        assert_eq!(
            coerce_value(&json!("style:0.8, detail"), &ParamType::LoraWeight),
            json!([{"path": "style", "scale": 0.8}, {"path": "detail", "scale": 1.0}])
        );
        assert_eq!(
            coerce_value(&json!("https://hf.co/a.safetensors:0.6"), &ParamType::LoraWeight),
            json!([{"path": "https://hf.co/a.safetensors", "scale": 0.6}])
        );
        assert_eq!(
            coerce_value(&json!("https://hf.co/a.safetensors"), &ParamType::LoraWeight),
            json!([{"path": "https://hf.co/a.safetensors", "scale": 1.0}])
        );
    }

    #[test]
    fn test_malformed_lora_pair_dropped() {
        assert_eq!(coerce_value(&json!("path1:abc"), &ParamType::LoraWeight), json!([]));
        assert_eq!(
            coerce_value(&json!("path1:abc,path2:0.5"), &ParamType::LoraWeight),
            json!([{"path": "path2", "scale": 0.5}])
        );
    }
}
