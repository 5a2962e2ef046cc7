//! Response mutation.
//!
//! Two modes: merge patches fields into the upstream JSON body, replace
//! substitutes status, body and headers from the rule.

use crate::config::{value_text, ResponseReplacement, Rule};
use crate::error::MutationError;
use crate::flow::FlowResponse;
use serde::Serialize;
use serde_json::{Map, Value};

/// What a matched rule did to the response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    /// Fields patched into the upstream JSON body
    Merged { fields: usize },
    /// Response replaced from the rule
    Replaced { status_code: u16 },
    /// Merge aborted, response left untouched
    Failed { error: String },
    /// Rule has no merge or replace section
    DelayOnly,
}

impl Mutation {
    /// Short label for log lines.
    pub fn describe(&self) -> String {
        match self {
            Mutation::Merged { .. } => "modified existing".to_string(),
            Mutation::Replaced { status_code } => format!("replaced with {}", status_code),
            Mutation::Failed { .. } => "merge failed".to_string(),
            Mutation::DelayOnly => "delay only".to_string(),
        }
    }
}

/// Apply a matched rule's mutation to a response.
///
/// Merge mode takes precedence when a rule also carries a replacement.
pub fn apply_rule(rule: &Rule, response: &mut FlowResponse) -> Mutation {
    if rule.modify_existing {
        return match merge_into_body(response, &rule.modifications) {
            Ok(()) => Mutation::Merged {
                fields: rule.modifications.len(),
            },
            Err(e) => Mutation::Failed {
                error: e.to_string(),
            },
        };
    }

    match &rule.response {
        Some(replacement) => match replace_response(response, replacement) {
            Ok(()) => Mutation::Replaced {
                status_code: response.status_code,
            },
            Err(e) => Mutation::Failed {
                error: e.to_string(),
            },
        },
        None => Mutation::DelayOnly,
    }
}

/// Patch dotted-path modifications into the response's JSON body.
///
/// On any error the response is left exactly as it was.
pub fn merge_into_body(
    response: &mut FlowResponse,
    modifications: &Map<String, Value>,
) -> Result<(), MutationError> {
    let mut document: Value = serde_json::from_slice(&response.body)?;

    if !document.is_object() {
        return Err(MutationError::NotAnObject(json_kind(&document)));
    }
    if let Value::Object(root) = &mut document {
        for (path, value) in modifications {
            set_nested_value(root, path, value.clone());
        }
    }

    let body = serde_json::to_vec(&document).map_err(MutationError::Serialize)?;
    response.set_body(body);
    Ok(())
}

/// Overwrite status, body and headers from a replacement spec.
///
/// Structured bodies (objects, arrays) are sent as JSON and force
/// `content-type: application/json`; `null` empties the body; other values are
/// sent as text with the content type left alone.
pub fn replace_response(
    response: &mut FlowResponse,
    replacement: &ResponseReplacement,
) -> Result<(), MutationError> {
    if let Some(status) = replacement.status_code {
        response.status_code = status;
    }

    if let Some(body) = &replacement.body {
        match body {
            Value::Object(_) | Value::Array(_) => {
                let bytes = serde_json::to_vec(body).map_err(MutationError::Serialize)?;
                response.set_body(bytes);
                response.headers.set("content-type", "application/json");
            }
            Value::Null => response.set_body(Vec::new()),
            other => response.set_body(value_text(other).into_owned()),
        }
    }

    for (name, value) in &replacement.headers {
        response.headers.set(name.as_str(), value_text(value).into_owned());
    }

    Ok(())
}

/// Set `value` at a dot-delimited `path` inside `target`.
///
/// Missing intermediate levels are created as objects; an intermediate level
/// holding a non-object value is replaced by an empty object.
pub fn set_nested_value(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or_default();

    let mut current = target;
    for segment in segments {
        let entry = current
            .entry(segment)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }

    current.insert(leaf.to_string(), value);
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
