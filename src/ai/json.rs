//! Pulling a JSON object out of free-form model output.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{ErrorCode, OrchestraResult, PipelineError};

fn fenced_json_re() -> OrchestraResult<&'static Regex> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)[ \t]*\r?\n(.*?)```"))
        .as_ref()
        .map_err(|e| {
            PipelineError::new(ErrorCode::AiResponseParseFailed, format!("Invalid fence pattern: {e}"))
        })
}

/// Parse `text` as JSON, falling back to the first ```` ```json ```` fenced
/// block.
pub fn extract_json(text: &str) -> OrchestraResult<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let Some(block) = fenced_json_re()?.captures(text).and_then(|c| c.get(1)) else {
        return Err(parse_failed(
            "Response is neither valid JSON nor contains a ```json fenced block",
            text,
        ));
    };
    serde_json::from_str::<Value>(block.as_str().trim()).map_err(|e| {
        parse_failed(&format!("Fenced JSON block is malformed: {e}"), text)
            .with_meta("line", e.line())
            .with_meta("column", e.column())
    })
}

/// Like [`extract_json`], requiring a top-level object.
pub fn extract_json_object(text: &str) -> OrchestraResult<Map<String, Value>> {
    match extract_json(text)? {
        Value::Object(map) => Ok(map),
        other => Err(parse_failed(
            &format!("Expected a JSON object, found {}", json_kind(&other)),
            text,
        )),
    }
}

/// Human name of a JSON value's type.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_failed(message: &str, text: &str) -> PipelineError {
    let preview: String = text.chars().take(120).collect();
    PipelineError::new(ErrorCode::AiResponseParseFailed, message).with_meta("preview", preview)
}
