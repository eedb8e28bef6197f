//! Merge-response parsing.
//!
//! Every failure is `AI_RESPONSE_PARSE_FAILED` with the offending field in
//! `meta.field` and in the message.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::ai::json::{extract_json_object, json_kind};
use crate::error::{ErrorCode, OrchestraResult, PipelineError};

use super::graph::{merge_themes, DiscoveryGraph, MergeResult, Theme};

fn field_error(field: &str, problem: &str) -> PipelineError {
    PipelineError::new(
        ErrorCode::AiResponseParseFailed,
        format!("Invalid merge response: field '{field}' {problem}"),
    )
    .with_meta("field", field)
}

fn require<'a>(obj: &'a Map<String, Value>, key: &str, path: &str) -> OrchestraResult<&'a Value> {
    obj.get(key)
        .ok_or_else(|| field_error(path, "is missing"))
}

fn decode<T: DeserializeOwned>(value: Value, field: &str) -> OrchestraResult<T> {
    serde_json::from_value(value).map_err(|e| field_error(field, &format!("is malformed: {e}")))
}

/// Structural checks on `graph` before decoding it.
fn check_graph(graph: &Value) -> OrchestraResult<()> {
    let Some(obj) = graph.as_object() else {
        return Err(field_error(
            "graph",
            &format!("must be an object, found {}", json_kind(graph)),
        ));
    };

    let project = require(obj, "project", "graph.project")?;
    if !project.is_object() {
        return Err(field_error("graph.project", "must be an object"));
    }

    let components = require(obj, "components", "graph.components")?;
    let Some(components) = components.as_array() else {
        return Err(field_error("graph.components", "must be a sequence"));
    };
    for (i, component) in components.iter().enumerate() {
        let Some(c) = component.as_object() else {
            return Err(field_error(&format!("graph.components[{i}]"), "must be an object"));
        };
        let has_key = |k: &str| c.get(k).and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty());
        if !has_key("id") && !has_key("name") {
            return Err(field_error(&format!("graph.components[{i}].id"), "is missing"));
        }
    }

    let categories = require(obj, "categories", "graph.categories")?;
    if !categories.is_array() {
        return Err(field_error("graph.categories", "must be a sequence"));
    }
    Ok(())
}

/// Parse one merge response, bare or wrapped in a ```` ```json ```` fence.
///
/// Ids and theme slugs come back normalized; duplicate themes are folded.
/// `coverage` defaults to 0 and is clamped to `[0, 1]`.
pub fn parse_merge_response(text: &str) -> OrchestraResult<MergeResult> {
    let mut root = extract_json_object(text)?;

    let graph = root
        .remove("graph")
        .ok_or_else(|| field_error("graph", "is missing"))?;
    check_graph(&graph)?;
    let mut graph: DiscoveryGraph = decode(graph, "graph")?;
    graph.normalize();

    let converged = match root.get("converged") {
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(field_error(
                "converged",
                &format!("must be a boolean, found {}", json_kind(other)),
            ))
        }
        None => return Err(field_error("converged", "is missing")),
    };

    let coverage = match root.get("coverage") {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0).clamp(0.0, 1.0),
        Some(other) => {
            return Err(field_error(
                "coverage",
                &format!("must be a number, found {}", json_kind(other)),
            ))
        }
    };

    let raw_themes: Vec<Theme> = match root.remove("newThemes") {
        None | Some(Value::Null) => Vec::new(),
        Some(value @ Value::Array(_)) => decode(value, "newThemes")?,
        Some(other) => {
            return Err(field_error(
                "newThemes",
                &format!("must be a sequence, found {}", json_kind(&other)),
            ))
        }
    };
    let mut new_themes = Vec::with_capacity(raw_themes.len());
    merge_themes(&mut new_themes, raw_themes);

    let reason = root
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(MergeResult {
        graph,
        new_themes,
        converged,
        coverage,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "graph": {
                "project": {"name": "demo", "buildSystem": "cargo", "entryPoints": ["src/main.rs"]},
                "components": [
                    {"id": "Task Queue", "name": "Queue", "dependencies": ["Error Model"], "complexity": "high"},
                    {"id": "error model", "name": "Errors"}
                ],
                "categories": [{"name": "core", "description": "core"}],
                "architectureNotes": "layered"
            },
            "newThemes": [{"theme": "Retry Policy", "description": "backoff", "hints": ["retry.rs"]}],
            "converged": false,
            "coverage": 0.6,
            "reason": "retry logic not mapped yet"
        })
    }

    fn field_of(err: &PipelineError) -> Option<&str> {
        err.meta_value("field").and_then(Value::as_str)
    }

    #[test]
    fn parses_bare_json() {
        let r = parse_merge_response(&valid().to_string()).unwrap();
        assert!(!r.converged);
        assert_eq!(r.coverage, 0.6);
        assert_eq!(r.graph.components[0].id, "task-queue");
        assert!(r.graph.components[0].dependencies.contains("error-model"));
        assert_eq!(r.graph.project.build_system, "cargo");
        assert_eq!(r.new_themes[0].theme, "retry-policy");
        assert_eq!(r.reason, "retry logic not mapped yet");
    }

    #[test]
    fn fenced_and_bare_parse_equal() {
        let bare = parse_merge_response(&valid().to_string()).unwrap();
        let fenced = format!(
            "Merged result below.\n```json\n{}\n```\nDone.",
            serde_json::to_string_pretty(&valid()).unwrap()
        );
        assert_eq!(parse_merge_response(&fenced).unwrap(), bare);
    }

    #[test]
    fn optional_fields_default() {
        let text = r#"{"graph": {"project": {}, "components": [], "categories": []}, "converged": true}"#;
        let r = parse_merge_response(text).unwrap();
        assert!(r.converged);
        assert_eq!(r.coverage, 0.0);
        assert!(r.new_themes.is_empty());
        assert_eq!(r.reason, "");
    }

    #[test]
    fn null_fields_read_as_defaults() {
        let text = json!({
            "graph": {
                "project": {"name": "demo", "description": null, "entryPoints": null},
                "components": [
                    {"id": "Queue", "name": null, "purpose": null, "dependencies": null,
                     "keyFiles": null, "complexity": null}
                ],
                "categories": [{"name": "core", "description": null}],
                "architectureNotes": null
            },
            "newThemes": [{"theme": "retries", "description": null, "hints": null}],
            "converged": false
        })
        .to_string();

        let r = parse_merge_response(&text).unwrap();
        assert_eq!(r.graph.project.description, "");
        assert!(r.graph.project.entry_points.is_empty());
        let queue = r.graph.component("queue").unwrap();
        assert_eq!(queue.purpose, "");
        assert!(queue.dependencies.is_empty());
        assert_eq!(r.graph.architecture_notes, "");
        assert_eq!(r.graph.categories[0].description, "");
        assert!(r.new_themes[0].hints.is_empty());
    }

    #[test]
    fn malformed_json_fails() {
        let err = parse_merge_response("{\"graph\": ").unwrap_err();
        assert_eq!(err.code(), ErrorCode::AiResponseParseFailed);
        assert!(!err.message().is_empty());
    }

    #[test]
    fn missing_graph_names_field() {
        let err = parse_merge_response(r#"{"converged": true}"#).unwrap_err();
        assert_eq!(field_of(&err), Some("graph"));
        assert!(err.message().contains("graph"));
    }

    #[test]
    fn invalid_graph_names_field() {
        let cases = [
            (json!({"graph": [], "converged": true}), "graph"),
            (json!({"graph": {"components": [], "categories": []}, "converged": true}), "graph.project"),
            (
                json!({"graph": {"project": {}, "components": {}, "categories": []}, "converged": true}),
                "graph.components",
            ),
            (
                json!({"graph": {"project": {}, "components": [], "categories": "x"}, "converged": true}),
                "graph.categories",
            ),
            (
                json!({"graph": {"project": {}, "components": [{"purpose": "?"}], "categories": []}, "converged": true}),
                "graph.components[0].id",
            ),
        ];
        for (value, field) in cases {
            let err = parse_merge_response(&value.to_string()).unwrap_err();
            assert_eq!(field_of(&err), Some(field), "for {value}");
            assert!(err.message().contains(field));
        }
    }

    #[test]
    fn converged_is_required() {
        let mut v = valid();
        v.as_object_mut().unwrap().remove("converged");
        let err = parse_merge_response(&v.to_string()).unwrap_err();
        assert_eq!(field_of(&err), Some("converged"));

        v["converged"] = json!("yes");
        let err = parse_merge_response(&v.to_string()).unwrap_err();
        assert!(err.message().contains("boolean"));
    }

    #[test]
    fn coverage_is_clamped() {
        let mut v = valid();
        v["coverage"] = json!(1.7);
        assert_eq!(parse_merge_response(&v.to_string()).unwrap().coverage, 1.0);
    }
}
