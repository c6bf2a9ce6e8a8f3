//! Template Resolver & Type Coercer (`SPEC_FULL.md` §4.E).
//!
//! Substitutes `{{source.field}}` (and the tolerated legacy `{source.field}`)
//! references in a node's declared `inputs` against accumulated run state,
//! then coerces each resolved value to the type its block's `input_schema`
//! declares.
//!
//! A reference into an upstream node that failed propagates as
//! [`ResolverError::UpstreamError`] rather than resolving to an empty value —
//! `SPEC_FULL.md` §7's *UpstreamError* behavioral kind.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::types::{NodeResult, Schema, SchemaProperty};

/// Errors raised while resolving or coercing node inputs.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// A required input property has no value and no default.
    #[error("missing required property: {0}")]
    MissingRequired(String),
    /// A resolved value cannot be coerced to its declared schema type.
    #[error("cannot coerce property '{property}' (declared {declared}) from {actual}")]
    Coercion {
        /// Property name.
        property: String,
        /// Declared schema type.
        declared: String,
        /// Rendered form of the offending value.
        actual: String,
    },
    /// A template reference resolved to a node that failed.
    #[error("template reference to failed node '{node}': {message}")]
    UpstreamError {
        /// Id of the failed upstream node.
        node: String,
        /// The upstream failure's message.
        message: String,
    },
}

/// Where a template reference resolves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source<'a> {
    Node(&'a str),
    Memory,
    User,
}

/// Accumulated state a template reference can draw from.
pub struct ResolutionContext<'a> {
    /// Per-node results, keyed by node id — a failed node's reference
    /// raises [`ResolverError::UpstreamError`] rather than resolving empty.
    pub results: &'a HashMap<String, NodeResult>,
    /// The run's memory snapshot.
    pub memory: &'a Value,
    /// The triggering user's context.
    pub user: &'a Value,
}

// Matches `{{source.field.path}}` or the legacy `{source.field.path}`.
fn template_regex() -> Regex {
    Regex::new(r"\{\{?\s*([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*\}?\}")
        .expect("static regex is valid")
}

fn parse_reference(path: &str) -> Option<(Source<'_>, Vec<&str>)> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let rest: Vec<&str> = segments.collect();
    let source = match head {
        "memory" => Source::Memory,
        "user" => Source::User,
        node => Source::Node(node),
    };
    Some((source, rest))
}

fn lookup(ctx: &ResolutionContext<'_>, source: Source<'_>, path: &[&str]) -> Result<Option<Value>, ResolverError> {
    let root = match source {
        Source::Node(id) => match ctx.results.get(id) {
            None => return Ok(None),
            Some(NodeResult::Failure { message, .. }) => {
                return Err(ResolverError::UpstreamError {
                    node: id.to_owned(),
                    message: message.clone(),
                });
            }
            Some(NodeResult::Success { output }) => output,
        },
        Source::Memory => ctx.memory,
        Source::User => ctx.user,
    };

    let mut current = root;
    for segment in path {
        current = match current.as_object().and_then(|m| m.get(*segment)) {
            Some(v) => v,
            None => return Ok(None),
        };
    }
    Ok(Some(current.clone()))
}

/// Resolve a single template reference string (e.g. `node_a.count`) against
/// a context, returning `Ok(None)` when any segment of the path is absent.
///
/// # Errors
///
/// Returns [`ResolverError::UpstreamError`] when the reference names a node
/// that failed.
fn resolve_reference(ctx: &ResolutionContext<'_>, reference: &str) -> Result<Option<Value>, ResolverError> {
    match parse_reference(reference) {
        Some((source, path)) => lookup(ctx, source, &path),
        None => Ok(None),
    }
}

/// Resolve one raw input value (a string, container, or scalar) against the
/// given context, following `SPEC_FULL.md` §4.E's substitution rules.
///
/// # Errors
///
/// Returns [`ResolverError::UpstreamError`] when a template reference inside
/// `raw` names a node that failed.
pub fn resolve_value(ctx: &ResolutionContext<'_>, raw: &Value) -> Result<Value, ResolverError> {
    match raw {
        Value::String(text) => resolve_string(ctx, text),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(ctx, v))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(ctx, v).map(|rv| (k.clone(), rv)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_string(ctx: &ResolutionContext<'_>, text: &str) -> Result<Value, ResolverError> {
    let re = template_regex();
    let matches: Vec<_> = re.captures_iter(text).collect();

    if matches.len() == 1 {
        let m = &matches[0];
        let whole = m.get(0).expect("match group 0 always present");
        if whole.start() == 0 && whole.end() == text.len() {
            let reference = m.get(1).expect("capture group 1 present").as_str();
            return Ok(resolve_reference(ctx, reference)?.unwrap_or(Value::String(String::new())));
        }
    }

    if matches.is_empty() {
        return Ok(Value::String(text.to_owned()));
    }

    let mut rendered = String::with_capacity(text.len());
    let mut last_end = 0;
    for m in &matches {
        let whole = m.get(0).expect("match group 0 always present");
        rendered.push_str(&text[last_end..whole.start()]);
        let reference = m.get(1).expect("capture group 1 present").as_str();
        let value = resolve_reference(ctx, reference)?;
        rendered.push_str(&value.map(render_as_text).unwrap_or_default());
        last_end = whole.end();
    }
    rendered.push_str(&text[last_end..]);
    Ok(Value::String(rendered))
}

fn render_as_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve every declared input against `ctx`, then coerce each resolved
/// value to its schema property's declared type, filling defaults for
/// missing optional properties.
///
/// # Errors
///
/// Returns [`ResolverError::MissingRequired`] when a required property has
/// neither a resolvable value nor a default, [`ResolverError::Coercion`]
/// when a resolved value cannot be converted to its declared type, or
/// [`ResolverError::UpstreamError`] when a template reference names a
/// failed node.
pub fn resolve_inputs(
    ctx: &ResolutionContext<'_>,
    raw_inputs: &HashMap<String, Value>,
    schema: &Schema,
) -> Result<HashMap<String, Value>, ResolverError> {
    let mut resolved = HashMap::with_capacity(schema.properties.len());

    for (name, property) in &schema.properties {
        let value = match raw_inputs.get(name) {
            Some(raw) => Some(resolve_value(ctx, raw)?),
            None => None,
        };

        let value = match value {
            Some(v) if !v.is_null() => v,
            _ => match &property.default {
                Some(default) => default.clone(),
                None => {
                    if schema.required.contains(name) {
                        return Err(ResolverError::MissingRequired(name.clone()));
                    }
                    continue;
                }
            },
        };

        let coerced = coerce(name, &value, property)?;
        resolved.insert(name.clone(), coerced);
    }

    Ok(resolved)
}

/// Coerce `value` to the type declared by `property`.
///
/// # Errors
///
/// Returns [`ResolverError::Coercion`] when `value` cannot be converted.
pub fn coerce(name: &str, value: &Value, property: &SchemaProperty) -> Result<Value, ResolverError> {
    let declared = property.kind.as_str();
    let fail = || ResolverError::Coercion {
        property: name.to_owned(),
        declared: declared.to_owned(),
        actual: value.to_string(),
    };

    match declared {
        "integer" => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => {
                let f = n.as_f64().ok_or_else(fail)?;
                if f.fract() == 0.0 {
                    format!("{f:.0}")
                        .parse::<i64>()
                        .map(Value::from)
                        .map_err(|_| fail())
                } else {
                    Err(fail())
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| fail()),
            _ => Err(fail()),
        },
        "number" => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| fail()),
            _ => Err(fail()),
        },
        "boolean" => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        "string" => match value {
            Value::String(_) => Ok(value.clone()),
            other => Ok(Value::String(other.to_string())),
        },
        "array" => match value {
            Value::Array(_) => Ok(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) => Ok(parsed),
                _ => Ok(Value::Array(vec![value.clone()])),
            },
            other => Ok(Value::Array(vec![other.clone()])),
        },
        "object" => match value {
            Value::Object(_) => Ok(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        _ => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchemaProperty;
    use serde_json::json;

    fn context<'a>(
        results: &'a HashMap<String, NodeResult>,
        memory: &'a Value,
        user: &'a Value,
    ) -> ResolutionContext<'a> {
        ResolutionContext {
            results,
            memory,
            user,
        }
    }

    #[test]
    fn test_whole_string_template_preserves_native_type() {
        let mut results = HashMap::new();
        results.insert(
            "fetch".to_owned(),
            NodeResult::Success { output: json!({"items": [1, 2, 3]}) },
        );
        let memory = json!({});
        let user = json!({});
        let ctx = context(&results, &memory, &user);

        let resolved = resolve_value(&ctx, &json!("{{fetch.items}}")).expect("resolves");
        assert_eq!(resolved, json!([1, 2, 3]));
    }

    #[test]
    fn test_mixed_text_and_template_interpolates_as_string() {
        let mut results = HashMap::new();
        results.insert(
            "step".to_owned(),
            NodeResult::Success { output: json!({"name": "alice"}) },
        );
        let memory = json!({});
        let user = json!({});
        let ctx = context(&results, &memory, &user);

        let resolved = resolve_value(&ctx, &json!("hello {{step.name}}!")).expect("resolves");
        assert_eq!(resolved, json!("hello alice!"));
    }

    #[test]
    fn test_missing_reference_renders_empty_string() {
        let results = HashMap::new();
        let memory = json!({});
        let user = json!({});
        let ctx = context(&results, &memory, &user);

        let resolved = resolve_value(&ctx, &json!("value: {{missing.field}}")).expect("resolves");
        assert_eq!(resolved, json!("value: "));
    }

    #[test]
    fn test_reference_to_failed_node_is_upstream_error() {
        let mut results = HashMap::new();
        results.insert(
            "fetch".to_owned(),
            NodeResult::Failure { kind: "timeout".to_owned(), message: "deadline exceeded".to_owned() },
        );
        let memory = json!({});
        let user = json!({});
        let ctx = context(&results, &memory, &user);

        let err = resolve_value(&ctx, &json!("{{fetch.items}}")).unwrap_err();
        assert!(matches!(err, ResolverError::UpstreamError { .. }));
    }

    #[test]
    fn test_coerce_integer_from_float_truncation() {
        let property = SchemaProperty {
            kind: "integer".to_owned(),
            description: String::new(),
            default: None,
        };
        let coerced = coerce("count", &json!(3.0), &property).expect("coerces");
        assert_eq!(coerced, json!(3));
    }

    #[test]
    fn test_coerce_object_from_string_is_hard_error() {
        let property = SchemaProperty {
            kind: "object".to_owned(),
            description: String::new(),
            default: None,
        };
        let result = coerce("config", &json!("not json"), &property);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_inputs_fills_default_for_missing_optional() {
        let mut schema = Schema::default();
        schema.properties.insert(
            "limit".to_owned(),
            SchemaProperty {
                kind: "integer".to_owned(),
                description: String::new(),
                default: Some(json!(10)),
            },
        );
        let raw_inputs = HashMap::new();
        let results = HashMap::new();
        let memory = json!({});
        let user = json!({});
        let ctx = context(&results, &memory, &user);

        let resolved = resolve_inputs(&ctx, &raw_inputs, &schema).expect("resolves");
        assert_eq!(resolved.get("limit"), Some(&json!(10)));
    }

    #[test]
    fn test_resolve_inputs_missing_required_errors() {
        let mut schema = Schema::default();
        schema.required.push("query".to_owned());
        schema.properties.insert(
            "query".to_owned(),
            SchemaProperty {
                kind: "string".to_owned(),
                description: String::new(),
                default: None,
            },
        );
        let raw_inputs = HashMap::new();
        let results = HashMap::new();
        let memory = json!({});
        let user = json!({});
        let ctx = context(&results, &memory, &user);

        let err = resolve_inputs(&ctx, &raw_inputs, &schema).unwrap_err();
        assert!(matches!(err, ResolverError::MissingRequired(_)));
    }

    #[test]
    fn test_resolve_inputs_propagates_upstream_error() {
        let mut schema = Schema::default();
        schema.properties.insert(
            "summary".to_owned(),
            SchemaProperty { kind: "string".to_owned(), description: String::new(), default: None },
        );
        let mut raw_inputs = HashMap::new();
        raw_inputs.insert("summary".to_owned(), json!("{{fetch.text}}"));

        let mut results = HashMap::new();
        results.insert(
            "fetch".to_owned(),
            NodeResult::Failure { kind: "sandbox_error".to_owned(), message: "container refused".to_owned() },
        );
        let memory = json!({});
        let user = json!({});
        let ctx = context(&results, &memory, &user);

        let err = resolve_inputs(&ctx, &raw_inputs, &schema).unwrap_err();
        assert!(matches!(err, ResolverError::UpstreamError { .. }));
    }
}
