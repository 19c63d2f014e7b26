//! Structural checks on an assembled request payload

use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};

/// Empty strings, empty lists and null never reach the remote API. Zero and
/// false are real values.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Drop every field whose value is empty.
pub fn filter_empty(payload: Map<String, Value>) -> Map<String, Value> {
    payload
        .into_iter()
        .filter(|(_, value)| !is_empty_value(value))
        .collect()
}

/// Split a size component key into its prefix and component. A bare `width`
/// or `height` has the empty prefix.
fn size_component(key: &str) -> Option<(&str, &str)> {
    match key {
        "width" | "height" => Some(("", key)),
        _ => key
            .rsplit_once('_')
            .filter(|(_, component)| matches!(*component, "width" | "height")),
    }
}

/// Every `<prefix>_width` needs a `<prefix>_height` and vice versa.
pub fn validate_size_pairs(payload: &Map<String, Value>) -> Result<()> {
    // (prefix, has_width, has_height) in first-seen order
    let mut groups: Vec<(&str, bool, bool)> = Vec::new();
    for key in payload.keys() {
        let Some((prefix, component)) = size_component(key) else {
            continue;
        };
        let index = match groups.iter().position(|(p, _, _)| *p == prefix) {
            Some(index) => index,
            None => {
                groups.push((prefix, false, false));
                groups.len() - 1
            }
        };
        if component == "width" {
            groups[index].1 = true;
        } else {
            groups[index].2 = true;
        }
    }

    for (prefix, has_width, has_height) in groups {
        if has_width && !has_height {
            return Err(PipelineError::ValidationFailed(format!(
                "Size parameter '{}': Width is provided but Height is missing. Please provide both or leave both empty.",
                prefix
            )));
        }
        if has_height && !has_width {
            return Err(PipelineError::ValidationFailed(format!(
                "Size parameter '{}': Height is provided but Width is missing. Please provide both or leave both empty.",
                prefix
            )));
        }
    }
    Ok(())
}

/// The model path must be chosen before anything is uploaded.
pub fn require_model(model_id: &str) -> Result<&str> {
    let model = model_id.trim();
    if model.is_empty() {
        return Err(PipelineError::ValidationFailed(
            "Please select a model first.".to_string(),
        ));
    }
    Ok(model)
}
