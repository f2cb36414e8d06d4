//! C6 — wait primitives. Every primitive shares one contract: a deadline, a
//! polling interval, and detaches all listeners on every exit path.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::page_session::PageSession;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll an async predicate callback on the host until it returns true or the
/// deadline passes.
pub async fn wait_for_condition<F, Fut>(
    description: &str,
    timeout: Duration,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if predicate().await {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::timeout(description, timeout));
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Evaluate a returns-boolean expression remotely; swallows evaluation
/// exceptions and keeps polling until the deadline.
pub async fn wait_for_function(
    session: &PageSession,
    expression: &str,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let truthy = evaluate_truthy(session, expression).await.unwrap_or(false);
        if truthy {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::timeout(format!("function: {expression}"), timeout));
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

async fn evaluate_truthy(session: &PageSession, expression: &str) -> Result<bool> {
    let result: Value = session
        .send(
            "Runtime.evaluate",
            json!({ "expression": expression, "returnByValue": true }),
        )
        .await?;
    Ok(result
        .get("result")
        .and_then(|r| r.get("value"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

/// Subscribes to request-will-be-sent and loading-finished/failed; resolves when
/// the in-flight counter has been zero for `idle_time` uninterrupted.
pub async fn wait_for_network_idle(
    session: &PageSession,
    idle_time: Duration,
    timeout: Duration,
) -> Result<()> {
    let in_flight = Arc::new(AtomicI64::new(0));
    let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));

    let counter = in_flight.clone();
    let activity = last_activity.clone();
    let req_sub = session
        .on("Network.requestWillBeSent", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut guard) = activity.lock() {
                *guard = Instant::now();
            }
        })
        .await?;

    let counter = in_flight.clone();
    let activity = last_activity.clone();
    let finished_sub = session
        .on("Network.loadingFinished", move |_| {
            counter.fetch_sub(1, Ordering::SeqCst);
            if let Ok(mut guard) = activity.lock() {
                *guard = Instant::now();
            }
        })
        .await?;

    let counter = in_flight.clone();
    let activity = last_activity.clone();
    let failed_sub = session
        .on("Network.loadingFailed", move |_| {
            counter.fetch_sub(1, Ordering::SeqCst);
            if let Ok(mut guard) = activity.lock() {
                *guard = Instant::now();
            }
        })
        .await?;

    let start = Instant::now();
    let result = loop {
        let idle_since = last_activity
            .lock()
            .map(|g| g.elapsed())
            .unwrap_or(Duration::ZERO);
        let count = in_flight.load(Ordering::SeqCst);

        if count <= 0 && idle_since >= idle_time {
            break Ok(());
        }
        if start.elapsed() >= timeout {
            break Err(Error::timeout("networkIdle", timeout));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    session.off("Network.requestWillBeSent", req_sub).await;
    session.off("Network.loadingFinished", finished_sub).await;
    session.off("Network.loadingFailed", failed_sub).await;

    result
}

/// Polls `document.readyState` until it reaches or exceeds the target stage.
pub async fn wait_for_document_ready(session: &PageSession, timeout: Duration) -> Result<()> {
    wait_for_function(
        session,
        "(function(){var s=document.readyState; return s==='interactive'||s==='complete';})()",
        timeout,
    )
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityIntent {
    Visible,
    Hidden,
    Attached,
}

/// Remote polling that also verifies visibility/hidden depending on caller intent.
pub async fn wait_for_selector(
    session: &PageSession,
    selector: &str,
    intent: VisibilityIntent,
    timeout: Duration,
) -> Result<()> {
    let sel_json = serde_json::to_string(selector).unwrap_or_default();
    let expr = match intent {
        VisibilityIntent::Attached => format!(
            "(function(){{ return document.querySelector({sel_json}) !== null; }})()"
        ),
        VisibilityIntent::Visible => format!(
            r#"(function(){{
                var el = document.querySelector({sel_json});
                if (!el) return false;
                var r = el.getBoundingClientRect();
                var s = getComputedStyle(el);
                return s.display !== 'none' && s.visibility !== 'hidden' && parseFloat(s.opacity) > 0 && r.width > 0 && r.height > 0;
            }})()"#
        ),
        VisibilityIntent::Hidden => format!(
            r#"(function(){{
                var el = document.querySelector({sel_json});
                if (!el) return true;
                var r = el.getBoundingClientRect();
                var s = getComputedStyle(el);
                return s.display === 'none' || s.visibility === 'hidden' || parseFloat(s.opacity) === 0 || (r.width === 0 && r.height === 0);
            }})()"#
        ),
    };

    wait_for_function(session, &expr, timeout)
        .await
        .map_err(|_| Error::timeout(format!("selector: {selector}"), timeout))
}

/// Case-insensitive (default) or exact-match remote polling of
/// `document.body.innerText`.
pub async fn wait_for_text(
    session: &PageSession,
    text: &str,
    exact: bool,
    timeout: Duration,
) -> Result<()> {
    let text_json = serde_json::to_string(text).unwrap_or_default();
    let expr = if exact {
        format!(
            "(function(){{ return (document.body.innerText||'').trim() === {text_json}; }})()"
        )
    } else {
        format!(
            "(function(){{ return (document.body.innerText||'').toLowerCase().includes({text_json}.toLowerCase()); }})()"
        )
    };
    wait_for_function(session, &expr, timeout)
        .await
        .map_err(|_| Error::timeout(format!("text: {text}"), timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_condition_resolves_as_soon_as_predicate_is_true() {
        let mut calls = 0;
        let result = wait_for_condition("counter", Duration::from_secs(1), || {
            calls += 1;
            let ready = calls >= 3;
            async move { ready }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn wait_for_condition_times_out_with_descriptor_in_message() {
        let result = wait_for_condition("never-true", Duration::from_millis(150), || async { false }).await;
        let err = result.unwrap_err();
        assert!(err.message.contains("never-true"));
    }
}
