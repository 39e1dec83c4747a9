//! Render tools: pure `{component, props}` builders

use serde_json::{Map, Value};

use super::registry::{Capability, ToolResult, UiDescriptor};

/// String argument, or empty when absent. Numbers are stringified since
/// models pass `"3"` and `3` interchangeably.
fn text(args: &Value, key: &str) -> String {
    match args.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn optional_text(args: &Value, key: &str) -> Option<String> {
    Some(text(args, key)).filter(|s| !s.trim().is_empty())
}

fn integer(args: &Value, key: &str) -> Option<i64> {
    match args.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A JSON array passed as a string (or directly). Anything unparseable
/// or not an array becomes `[]`.
pub(crate) fn json_list(args: &Value, key: &str) -> Value {
    let parsed = match args.get(key) {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    match parsed {
        Value::Array(_) => parsed,
        _ => Value::Array(Vec::new()),
    }
}

/// Build props, leaving out absent optional values.
fn props(entries: Vec<(&str, Option<Value>)>) -> Value {
    let map: Map<String, Value> = entries
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
        .collect();
    Value::Object(map)
}

pub(super) fn render(capability: Capability, args: &Value) -> Result<UiDescriptor, ToolResult> {
    let descriptor = match capability {
        Capability::RenderInsightCard => UiDescriptor::new(
            "insight_card",
            props(vec![
                ("title", Some(text(args, "title").into())),
                ("description", Some(text(args, "description").into())),
                ("severity", Some(text(args, "severity").into())),
                ("signalCount", Some(integer(args, "signal_count").unwrap_or(0).into())),
                ("evidence", Some(json_list(args, "evidence_json"))),
            ]),
        ),
        Capability::RenderLinearCard => UiDescriptor::new(
            "linear_card",
            props(vec![
                ("ticketId", Some(text(args, "ticket_id").into())),
                ("title", Some(text(args, "title").into())),
                ("status", Some(text(args, "status").into())),
                ("assignee", optional_text(args, "assignee").map(Value::from)),
                ("priority", integer(args, "priority").map(Value::from)),
            ]),
        ),
        Capability::RenderSignalList => UiDescriptor::new(
            "signal_list",
            props(vec![("signals", Some(json_list(args, "signals_json")))]),
        ),
        Capability::RenderActionPlan => UiDescriptor::new(
            "action_plan",
            props(vec![("actions", Some(json_list(args, "actions_json")))]),
        ),
        Capability::RenderDraftCard => UiDescriptor::new(
            "draft_card",
            props(vec![
                ("title", Some(text(args, "title").into())),
                ("sections", Some(json_list(args, "sections_json"))),
                (
                    "status",
                    Some(optional_text(args, "status").unwrap_or_else(|| "draft".into()).into()),
                ),
                ("artifactId", optional_text(args, "artifact_id").map(Value::from)),
            ]),
        ),
        Capability::RenderForm => UiDescriptor::new(
            "form",
            props(vec![
                ("title", Some(text(args, "title").into())),
                ("description", optional_text(args, "description").map(Value::from)),
                ("action", Some(text(args, "action").into())),
                ("fields", Some(json_list(args, "fields_json"))),
            ]),
        ),
        other => {
            return Err(ToolResult::error_with_code(
                "tool_error",
                format!("'{}' is not a render tool", other.name()),
            ))
        }
    };
    Ok(descriptor)
}
