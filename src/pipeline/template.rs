//! `{{variable}}` prompt templates rendered from item fields.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{ErrorCode, OrchestraResult, PipelineError};

fn placeholder_re() -> OrchestraResult<&'static Regex> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}"))
        .as_ref()
        .map_err(|e| {
            PipelineError::new(ErrorCode::TemplateError, format!("Invalid placeholder pattern: {e}"))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(String),
}

/// A parsed template. Variables may be dotted paths into nested objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `source`. An unterminated or malformed placeholder is a
    /// `TEMPLATE_ERROR`.
    pub fn parse(source: &str) -> OrchestraResult<Self> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in placeholder_re()?.captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            let literal = &source[last..whole.start()];
            check_literal(source, literal, last)?;
            if !literal.is_empty() {
                segments.push(Segment::Text(literal.to_string()));
            }
            segments.push(Segment::Var(caps[1].to_string()));
            last = whole.end();
        }
        let tail = &source[last..];
        check_literal(source, tail, last)?;
        if !tail.is_empty() {
            segments.push(Segment::Text(tail.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Variable names in order of first appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for seg in &self.segments {
            if let Segment::Var(name) = seg {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitute every placeholder from `vars`.
    ///
    /// Strings are inserted raw; other values as compact JSON. A name with no
    /// value (or `null`) is a `MISSING_VARIABLE`.
    pub fn render(&self, vars: &Map<String, Value>) -> OrchestraResult<String> {
        let mut out = String::with_capacity(self.source.len());
        for seg in &self.segments {
            match seg {
                Segment::Text(text) => out.push_str(text),
                Segment::Var(name) => match lookup(vars, name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {
                        return Err(PipelineError::new(
                            ErrorCode::MissingVariable,
                            format!("Template variable '{name}' has no value"),
                        )
                        .with_meta("variable", name.as_str())
                        .with_meta("available", vars.keys().cloned().collect::<Vec<_>>()));
                    }
                    Some(other) => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(out)
    }
}

/// Parse and render in one step.
pub fn render(source: &str, vars: &Map<String, Value>) -> OrchestraResult<String> {
    Template::parse(source)?.render(vars)
}

fn lookup<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Literal text between placeholders must not contain a stray `{{`.
fn check_literal(source: &str, literal: &str, offset: usize) -> OrchestraResult<()> {
    match literal.find("{{") {
        None => Ok(()),
        Some(pos) => {
            let at = offset + pos;
            let detail = if source[at..].contains("}}") {
                "malformed placeholder"
            } else {
                "unterminated placeholder"
            };
            Err(PipelineError::new(
                ErrorCode::TemplateError,
                format!("Template has a {detail} at byte {at}"),
            )
            .with_meta("position", at))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn placeholder_pattern_compiles() {
        assert!(placeholder_re().is_ok());
    }

    #[test]
    fn renders_strings_raw_and_values_as_json() {
        let t = Template::parse("Summarize {{ title }} ({{count}} files, tags {{tags}})").unwrap();
        let out = t
            .render(&vars(json!({"title": "core", "count": 3, "tags": ["a", "b"]})))
            .unwrap();
        assert_eq!(out, r#"Summarize core (3 files, tags ["a","b"])"#);
    }

    #[test]
    fn dotted_paths_reach_nested_fields() {
        let out = render(
            "{{file.path}} by {{authors.0}}",
            &vars(json!({"file": {"path": "src/lib.rs"}, "authors": ["ana"]})),
        )
        .unwrap();
        assert_eq!(out, "src/lib.rs by ana");
    }

    #[test]
    fn missing_variable() {
        let err = render("Hello {{name}}", &vars(json!({"other": 1}))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingVariable);
        assert_eq!(err.meta_value("variable"), Some(&json!("name")));

        let err = render("{{gone}}", &vars(json!({"gone": null}))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingVariable);
    }

    #[test]
    fn malformed_templates() {
        let err = Template::parse("Hello {{name").unwrap_err();
        assert_eq!(err.code(), ErrorCode::TemplateError);
        assert!(err.message().contains("unterminated"));

        let err = Template::parse("Hello {{ bad name }}").unwrap_err();
        assert_eq!(err.code(), ErrorCode::TemplateError);
        assert!(err.message().contains("malformed"));
    }

    #[test]
    fn lists_variables_once() {
        let t = Template::parse("{{a}} {{b}} {{a}}").unwrap();
        assert_eq!(t.variables(), vec!["a", "b"]);
        assert_eq!(Template::parse("plain").unwrap().variables(), Vec::<&str>::new());
    }
}
