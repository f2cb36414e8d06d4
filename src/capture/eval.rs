//! Eval serializer host side: invokes the embedded serializer and deepens its
//! tagged envelope. `process_result` is a pure recursive walk — it does not
//! touch the remote runtime.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::page_session::PageSession;
use crate::scripts;

async fn ensure_serializer(session: &PageSession) -> Result<()> {
    let _: Value = session
        .send(
            "Runtime.evaluate",
            serde_json::json!({ "expression": scripts::eval_serializer(), "returnByValue": true }),
        )
        .await?;
    Ok(())
}

/// Evaluates `expression`, passes the result through the embedded serializer,
/// and returns the resulting tagged envelope.
pub async fn evaluate_and_serialize(session: &PageSession, expression: &str) -> Result<Value> {
    evaluate_and_serialize_in_context(session, expression, None).await
}

/// Same as `evaluate_and_serialize`, but scoped to a specific execution
/// context (spec §9 Open Question (a): `contextId` is forwarded verbatim,
/// untyped, to `Runtime.evaluate`). `None` evaluates in the page's default
/// (main-frame) context.
pub async fn evaluate_and_serialize_in_context(
    session: &PageSession,
    expression: &str,
    context_id: Option<i64>,
) -> Result<Value> {
    ensure_serializer(session).await?;
    let wrapped = format!(
        "window.__browserstepSerialize((function(){{ return ({expression}); }})())"
    );
    let mut params = serde_json::json!({ "expression": wrapped, "returnByValue": true });
    if let Some(context_id) = context_id {
        params["contextId"] = serde_json::json!(context_id);
    }
    let result: Value = session.send("Runtime.evaluate", params).await?;
    result
        .get("result")
        .and_then(|r| r.get("value"))
        .cloned()
        .ok_or_else(|| Error::protocol("evaluate_and_serialize returned no value"))
}

/// Recursively deepens a tagged envelope into plain JSON, unwrapping the
/// `{tag, ...}` shape produced by the embedded serializer into ordinary
/// `serde_json::Value` structures a caller can inspect without knowing the
/// tag vocabulary.
pub fn process_result(envelope: &Value) -> Value {
    let Some(tag) = envelope.get("tag").and_then(|v| v.as_str()) else {
        return envelope.clone();
    };

    match tag {
        "null" => Value::Null,
        "undefined" => Value::Null,
        "number" | "string" | "boolean" => envelope
            .get("value")
            .cloned()
            .or_else(|| envelope.get("repr").cloned())
            .unwrap_or(Value::Null),
        "bigint" | "symbol" | "function" => envelope.get("repr").cloned().unwrap_or(Value::Null),
        "date" => envelope.clone(),
        "map" => {
            let entries = envelope
                .get("entries")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .map(|pair| {
                            let arr = pair.as_array().cloned().unwrap_or_default();
                            let key = arr.first().map(process_result).unwrap_or(Value::Null);
                            let value = arr.get(1).map(process_result).unwrap_or(Value::Null);
                            serde_json::json!([key, value])
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            serde_json::json!({ "tag": "map", "size": envelope.get("size"), "entries": entries })
        }
        "set" => {
            let values = envelope
                .get("values")
                .and_then(|v| v.as_array())
                .map(|items| items.iter().map(process_result).collect::<Vec<_>>())
                .unwrap_or_default();
            serde_json::json!({ "tag": "set", "size": envelope.get("size"), "values": values })
        }
        "array" | "nodelist" => {
            let items = envelope
                .get("items")
                .and_then(|v| v.as_array())
                .map(|items| items.iter().map(process_result).collect::<Vec<_>>())
                .unwrap_or_default();
            serde_json::json!({
                "tag": tag,
                "length": envelope.get("length"),
                "items": items,
                "truncated": envelope.get("truncated").cloned().unwrap_or(Value::Bool(false)),
            })
        }
        "object" => {
            let entries = envelope
                .get("entries")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .map(|pair| {
                            let arr = pair.as_array().cloned().unwrap_or_default();
                            let key = arr.first().and_then(|v| v.as_str()).unwrap_or("").to_string();
                            let value = arr.get(1).map(process_result).unwrap_or(Value::Null);
                            serde_json::json!([key, value])
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            // Entries stay an array of [key, value] pairs (not a map) so a
            // second pass over this same output reads identically to the first.
            serde_json::json!({
                "tag": "object",
                "keys": envelope.get("keys"),
                "entries": entries,
                "truncated": envelope.get("truncated").cloned().unwrap_or(Value::Bool(false)),
            })
        }
        _ => envelope.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn process_result_unwraps_primitive_tags() {
        assert_eq!(process_result(&json!({ "tag": "number", "value": 42.0 })), json!(42.0));
        assert_eq!(process_result(&json!({ "tag": "string", "value": "hi" })), json!("hi"));
        assert_eq!(process_result(&json!({ "tag": "null" })), Value::Null);
    }

    #[test]
    fn process_result_recurses_into_arrays() {
        let envelope = json!({
            "tag": "array",
            "length": 2,
            "truncated": false,
            "items": [
                { "tag": "number", "value": 1.0 },
                { "tag": "string", "value": "a" },
            ],
        });
        let processed = process_result(&envelope);
        assert_eq!(processed["items"], json!([1.0, "a"]));
    }

    #[test]
    fn process_result_passes_through_unrecognized_values() {
        let raw = json!({ "foo": "bar" });
        assert_eq!(process_result(&raw), raw);
    }
}
