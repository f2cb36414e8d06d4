//! Dynamic steps: `pageFunction`, `poll`, `pipeline`. All three execute code
//! inside the remote runtime rather than dispatching fixed CDP commands.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::capture::eval;
use crate::error::{Error, Result};
use crate::page_session::PageSession;

/// Evaluates a single function, optionally passed the snapshot-ref table as
/// its sole argument, under a step-scoped timeout.
pub async fn run_page_function(
    session: &PageSession,
    function_src: &str,
    pass_ref_table: bool,
    timeout: Duration,
) -> Result<Value> {
    let arg = if pass_ref_table { "window.__ariaRefMeta" } else { "" };
    let call_expr = format!("({function_src})({arg})");

    let envelope = tokio::time::timeout(timeout, eval::evaluate_and_serialize(session, &call_expr))
        .await
        .map_err(|_| Error::timeout("pageFunction", timeout))??;
    Ok(eval::process_result(&envelope))
}

/// The fixed serialized-truthy rule (spec §4.11): not null/undefined, not
/// `false`, not `0`, not `""`.
pub fn is_serialized_truthy(envelope: &Value) -> bool {
    match envelope.get("tag").and_then(|v| v.as_str()) {
        Some("null") | Some("undefined") => false,
        Some("boolean") => envelope.get("value").and_then(|v| v.as_bool()).unwrap_or(false),
        Some("number") => envelope
            .get("value")
            .and_then(|v| v.as_f64())
            .map(|n| n != 0.0)
            .unwrap_or(true),
        Some("string") => envelope
            .get("value")
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(true),
        None => false,
        _ => true,
    }
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub resolved: bool,
    pub evaluations: u32,
    pub value: Value,
}

/// Repeatedly evaluates `expression` until it is serialized-truthy or the
/// deadline passes. Never fatally errors on expiry — the caller inspects
/// `resolved`.
pub async fn run_poll(
    session: &PageSession,
    expression: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<PollOutcome> {
    let start = Instant::now();
    let mut evaluations = 0u32;
    loop {
        evaluations += 1;
        let envelope = eval::evaluate_and_serialize(session, expression).await?;
        let truthy = is_serialized_truthy(&envelope);
        let value = eval::process_result(&envelope);
        if truthy {
            return Ok(PollOutcome { resolved: true, evaluations, value });
        }
        if start.elapsed() >= timeout {
            return Ok(PollOutcome { resolved: false, evaluations, value });
        }
        tokio::time::sleep(interval).await;
    }
}

/// Compiles one micro-op into a JS statement executed inside the pipeline's
/// async IIFE. Each statement pushes its own index onto `__steps` and a
/// result (or `null`) onto `__results` before the next runs.
fn compile_micro_op(op: &Value, index: usize) -> Result<String> {
    let push_prelude = format!("__steps.push({index});");

    if let Some(selector) = op.get("find").and_then(|v| v.as_str()) {
        let sel_json = serde_json::to_string(selector).unwrap_or_default();
        let find_decl = format!(
            "const __el{index} = document.querySelector({sel_json}); if (!__el{index}) throw new Error('not found: ' + {sel_json});"
        );
        let action = if let Some(value) = op.get("fill").and_then(|v| v.as_str()) {
            let value_json = serde_json::to_string(value).unwrap_or_default();
            format!(
                "__el{index}.value = {value_json}; __el{index}.dispatchEvent(new Event('input',{{bubbles:true}})); __el{index}.dispatchEvent(new Event('change',{{bubbles:true}})); __results.push(null);"
            )
        } else if op.get("click").is_some() {
            format!("__el{index}.click(); __results.push(null);")
        } else if let Some(text) = op.get("type").and_then(|v| v.as_str()) {
            let text_json = serde_json::to_string(text).unwrap_or_default();
            format!(
                "__el{index}.value = ({{}}).hasOwnProperty.call(__el{index}, 'value') ? (__el{index}.value || '') + {text_json} : {text_json}; __el{index}.dispatchEvent(new Event('input',{{bubbles:true}})); __results.push(null);"
            )
        } else if op.get("check").is_some() {
            let checked = op.get("check").and_then(|v| v.as_bool()).unwrap_or(true);
            format!(
                "__el{index}.checked = {checked}; __el{index}.dispatchEvent(new Event('change',{{bubbles:true}})); __results.push(null);"
            )
        } else if let Some(value) = op.get("select").and_then(|v| v.as_str()) {
            let value_json = serde_json::to_string(value).unwrap_or_default();
            format!(
                "__el{index}.value = {value_json}; __el{index}.dispatchEvent(new Event('change',{{bubbles:true}})); __results.push(null);"
            )
        } else {
            return Err(Error::step_validation(format!(
                "pipeline op {index}: find requires one of fill, click, type, check, select"
            )));
        };
        return Ok(format!("{push_prelude} {find_decl} {action}"));
    }

    if let Some(selector) = op.get("waitFor").and_then(|v| v.as_str()) {
        let sel_json = serde_json::to_string(selector).unwrap_or_default();
        return Ok(format!(
            "{push_prelude} await (async () => {{ const deadline = Date.now() + 5000; while (!document.querySelector({sel_json})) {{ if (Date.now() > deadline) throw new Error('waitFor timeout: ' + {sel_json}); await new Promise(r => setTimeout(r, 50)); }} }})(); __results.push(null);"
        ));
    }

    if let Some(ms) = op.get("sleep").and_then(|v| v.as_u64()) {
        return Ok(format!(
            "{push_prelude} await new Promise(r => setTimeout(r, {ms})); __results.push(null);"
        ));
    }

    if let Some(expr) = op.get("return").and_then(|v| v.as_str()) {
        return Ok(format!("{push_prelude} __results.push({expr});"));
    }

    Err(Error::step_validation(format!(
        "pipeline op {index}: unrecognized micro-op {op}"
    )))
}

/// Compiles the micro-op array into one async IIFE and evaluates it once
/// with `awaitPromise=true`.
pub async fn run_pipeline(session: &PageSession, ops: &[Value], timeout: Duration) -> Result<Value> {
    let mut statements = Vec::with_capacity(ops.len());
    for (index, op) in ops.iter().enumerate() {
        statements.push(compile_micro_op(op, index)?);
    }

    let body = statements.join("\n    ");
    let script = format!(
        r#"(async function() {{
    const __steps = [];
    const __results = [];
    try {{
    {body}
    return {{ completed: true, steps: __steps, results: __results }};
    }} catch (e) {{
    return {{ completed: false, steps: __steps, results: __results, failedAt: __steps.length - 1, error: String((e && e.message) || e) }};
    }}
}})()"#
    );

    let result: Value = tokio::time::timeout(
        timeout,
        session.send(
            "Runtime.evaluate",
            json!({ "expression": script, "returnByValue": true, "awaitPromise": true }),
        ),
    )
    .await
    .map_err(|_| Error::timeout("pipeline", timeout))??;

    result
        .get("result")
        .and_then(|r| r.get("value"))
        .cloned()
        .ok_or_else(|| Error::protocol("pipeline evaluation returned no value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_truthy_rejects_zero_and_empty_string() {
        assert!(!is_serialized_truthy(&json!({ "tag": "number", "value": 0.0 })));
        assert!(!is_serialized_truthy(&json!({ "tag": "string", "value": "" })));
        assert!(!is_serialized_truthy(&json!({ "tag": "boolean", "value": false })));
        assert!(!is_serialized_truthy(&json!({ "tag": "null" })));
        assert!(!is_serialized_truthy(&json!({ "tag": "undefined" })));
    }

    #[test]
    fn serialized_truthy_accepts_nonzero_and_objects() {
        assert!(is_serialized_truthy(&json!({ "tag": "number", "value": 3.0 })));
        assert!(is_serialized_truthy(&json!({ "tag": "string", "value": "hi" })));
        assert!(is_serialized_truthy(&json!({ "tag": "object", "entries": [] })));
    }

    #[test]
    fn compile_fill_op_includes_target_and_value() {
        let op = json!({ "find": "#input", "fill": "hello" });
        let compiled = compile_micro_op(&op, 0).unwrap();
        assert!(compiled.contains("querySelector"));
        assert!(compiled.contains("hello"));
    }

    #[test]
    fn compile_unrecognized_op_is_a_validation_error() {
        let op = json!({ "bogus": true });
        assert!(compile_micro_op(&op, 0).is_err());
    }

    #[test]
    fn compile_sleep_op_uses_set_timeout() {
        let op = json!({ "sleep": 250 });
        let compiled = compile_micro_op(&op, 2).unwrap();
        assert!(compiled.contains("setTimeout(r, 250)"));
    }
}
