//! C7 — element resolver. Resolves an `ElementRef` to a `ResolvedElement`
//! carrying a remote object id the caller must eventually release.

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::page_session::PageSession;
use crate::scripts;

#[derive(Debug, Clone)]
pub enum ElementRef {
    Selector(String),
    SnapshotRef(String),
    Text { text: String, exact: bool },
    RoleName { role: Option<String>, name: Option<String> },
    Coordinates { x: f64, y: f64 },
    Fallback(Vec<ElementRef>),
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    Selector,
    SnapshotRef,
    Text,
    RoleName,
    Coordinates,
}

#[derive(Debug, Clone)]
pub struct ResolvedElement {
    pub object_id: String,
    pub bounding_box: BoundingBox,
    pub resolved_by: ResolutionStrategy,
    pub snapshot_ref: Option<String>,
    pub role_name: Option<(String, String)>,
    pub candidate_index: Option<usize>,
}

/// Lazily installs the resolution helper bundle in the execution context.
/// Idempotent on the remote side, so calling this on every resolve is safe.
async fn ensure_helpers(session: &PageSession) -> Result<()> {
    let _: Value = session
        .send(
            "Runtime.evaluate",
            json!({ "expression": scripts::resolve_helpers(), "returnByValue": true }),
        )
        .await?;
    Ok(())
}

async fn bounding_box(session: &PageSession, object_id: &str) -> Result<BoundingBox> {
    let result: Value = session
        .send(
            "Runtime.callFunctionOn",
            json!({
                "objectId": object_id,
                "functionDeclaration": "function(){ return window.__browserstepResolve.boundingBox(this); }",
                "returnByValue": true,
            }),
        )
        .await?;
    let value = result.get("result").and_then(|r| r.get("value"));
    match value {
        Some(v) if v.is_object() => Ok(BoundingBox {
            x: v.get("x").and_then(|n| n.as_f64()).unwrap_or(0.0),
            y: v.get("y").and_then(|n| n.as_f64()).unwrap_or(0.0),
            width: v.get("width").and_then(|n| n.as_f64()).unwrap_or(0.0),
            height: v.get("height").and_then(|n| n.as_f64()).unwrap_or(0.0),
        }),
        _ => Ok(BoundingBox { x: 0.0, y: 0.0, width: 0.0, height: 0.0 }),
    }
}

/// Evaluates `expression`; treats a `null`/`undefined` result as "not found"
/// rather than an error, and returns the remote object id otherwise.
async fn evaluate_for_object_id(session: &PageSession, expression: &str) -> Result<Option<String>> {
    let result: Value = session
        .send(
            "Runtime.evaluate",
            json!({ "expression": expression, "returnByValue": false }),
        )
        .await?;
    let result_obj = result
        .get("result")
        .ok_or_else(|| Error::protocol("Runtime.evaluate missing result"))?;

    let subtype = result_obj.get("subtype").and_then(|v| v.as_str());
    let kind = result_obj.get("type").and_then(|v| v.as_str());
    if subtype == Some("null") || kind == Some("undefined") {
        return Ok(None);
    }

    Ok(result_obj.get("objectId").and_then(|v| v.as_str()).map(String::from))
}

async fn resolve_by_selector(session: &PageSession, selector: &str) -> Result<ResolvedElement> {
    if selector.trim().is_empty() {
        return Err(Error::element_not_found(selector));
    }
    ensure_helpers(session).await?;
    let sel_json = serde_json::to_string(selector).unwrap_or_default();
    let expr = format!("window.__browserstepResolve.bySelector({sel_json})");
    let object_id = evaluate_for_object_id(session, &expr)
        .await?
        .ok_or_else(|| Error::element_not_found(selector))?;
    let bounding_box = bounding_box(session, &object_id).await?;
    Ok(ResolvedElement {
        object_id,
        bounding_box,
        resolved_by: ResolutionStrategy::Selector,
        snapshot_ref: None,
        role_name: None,
        candidate_index: None,
    })
}

/// Looks up the ref's recorded selector first; falls back to role+name search,
/// piercing the recorded shadow-host path, all inside the embedded helper.
async fn resolve_by_ref(session: &PageSession, snapshot_ref: &str) -> Result<ResolvedElement> {
    ensure_helpers(session).await?;
    let ref_json = serde_json::to_string(snapshot_ref).unwrap_or_default();
    let expr = format!("window.__browserstepResolve.byRef({ref_json})");
    let object_id = evaluate_for_object_id(session, &expr)
        .await?
        .ok_or_else(|| Error::element_not_found(format!("ref={snapshot_ref}")))?;
    let bounding_box = bounding_box(session, &object_id).await?;
    Ok(ResolvedElement {
        object_id,
        bounding_box,
        resolved_by: ResolutionStrategy::SnapshotRef,
        snapshot_ref: Some(snapshot_ref.to_string()),
        role_name: None,
        candidate_index: None,
    })
}

async fn resolve_by_text(session: &PageSession, text: &str, exact: bool) -> Result<ResolvedElement> {
    if text.trim().is_empty() {
        return Err(Error::element_not_found(text));
    }
    ensure_helpers(session).await?;
    let text_json = serde_json::to_string(text).unwrap_or_default();
    let expr = format!("window.__browserstepResolve.byText({text_json}, {exact})");
    let object_id = evaluate_for_object_id(session, &expr)
        .await?
        .ok_or_else(|| Error::element_not_found(format!("text={text}")))?;
    let bounding_box = bounding_box(session, &object_id).await?;
    Ok(ResolvedElement {
        object_id,
        bounding_box,
        resolved_by: ResolutionStrategy::Text,
        snapshot_ref: None,
        role_name: None,
        candidate_index: None,
    })
}

async fn resolve_by_role_name(
    session: &PageSession,
    role: Option<&str>,
    name: Option<&str>,
) -> Result<ResolvedElement> {
    ensure_helpers(session).await?;
    let role_json = role.map(serde_json::to_string).transpose().unwrap_or_default().unwrap_or_else(|| "null".to_string());
    let name_json = name.map(serde_json::to_string).transpose().unwrap_or_default().unwrap_or_else(|| "null".to_string());
    let expr = format!("window.__browserstepResolve.byRoleName({role_json}, {name_json})");
    let label = format!("role={} name={}", role.unwrap_or(""), name.unwrap_or(""));
    let object_id = evaluate_for_object_id(session, &expr)
        .await?
        .ok_or_else(|| Error::element_not_found(&label))?;
    let bounding_box = bounding_box(session, &object_id).await?;
    Ok(ResolvedElement {
        object_id,
        bounding_box,
        resolved_by: ResolutionStrategy::RoleName,
        snapshot_ref: None,
        role_name: Some((role.unwrap_or("").to_string(), name.unwrap_or("").to_string())),
        candidate_index: None,
    })
}

async fn resolve_by_coordinates(session: &PageSession, x: f64, y: f64) -> Result<ResolvedElement> {
    ensure_helpers(session).await?;
    let expr = format!("window.__browserstepResolve.byPoint({x}, {y})");
    let object_id = evaluate_for_object_id(session, &expr)
        .await?
        .ok_or_else(|| Error::element_not_found(format!("point=({x},{y})")))?;
    let bounding_box = bounding_box(session, &object_id).await?;
    Ok(ResolvedElement {
        object_id,
        bounding_box,
        resolved_by: ResolutionStrategy::Coordinates,
        snapshot_ref: None,
        role_name: None,
        candidate_index: None,
    })
}

/// Resolves an `ElementRef`. A `Fallback` list is tried candidate by candidate
/// in the order given, recording which one succeeded.
pub async fn resolve(session: &PageSession, element_ref: &ElementRef) -> Result<ResolvedElement> {
    match element_ref {
        ElementRef::Selector(selector) => resolve_by_selector(session, selector).await,
        ElementRef::SnapshotRef(r) => resolve_by_ref(session, r).await,
        ElementRef::Text { text, exact } => resolve_by_text(session, text, *exact).await,
        ElementRef::RoleName { role, name } => {
            resolve_by_role_name(session, role.as_deref(), name.as_deref()).await
        }
        ElementRef::Coordinates { x, y } => resolve_by_coordinates(session, *x, *y).await,
        ElementRef::Fallback(candidates) => {
            let mut last_err = Error::element_not_found("empty fallback list");
            for (index, candidate) in candidates.iter().enumerate() {
                match Box::pin(resolve(session, candidate)).await {
                    Ok(mut resolved) => {
                        resolved.candidate_index = Some(index);
                        return Ok(resolved);
                    }
                    Err(e) => last_err = e,
                }
            }
            Err(last_err)
        }
    }
}

/// Every resolved handle must be released exactly once.
pub async fn release(session: &PageSession, object_id: &str) -> Result<()> {
    session
        .send::<Value>("Runtime.releaseObject", json!({ "objectId": object_id }))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use futures::{SinkExt, StreamExt};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Replies to every `Runtime.evaluate`/`Runtime.callFunctionOn` with a
    /// fixed "not found" result, regardless of the expression sent.
    async fn serve_not_found(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let frame: Value = serde_json::from_str(&text).unwrap();
            let id = frame.get("id").cloned().unwrap_or(Value::Null);
            let reply = json!({ "id": id, "result": { "result": { "type": "undefined" } } });
            if ws.send(Message::Text(reply.to_string())).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn selector_strategy_reports_element_not_found_on_undefined_result() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_not_found(listener));

        let transport = Arc::new(Transport::connect(&format!("ws://{addr}")).await.unwrap());
        let session = PageSession::new(transport, "s1".into(), "t1".into());

        let err = resolve(&session, &ElementRef::Selector("#missing".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ElementNotFound);
    }

    #[test]
    fn empty_selector_is_rejected_without_a_remote_call() {
        assert!(matches!(
            ElementRef::Selector(String::new()),
            ElementRef::Selector(s) if s.is_empty()
        ));
    }
}
