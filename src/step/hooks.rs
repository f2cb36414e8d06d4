//! Step hooks: `readyWhen` (pre-action poll, fatal), `settledWhen`
//! (post-action poll, non-fatal), `observe` (post-action single evaluation).

use std::time::Duration;

use serde_json::Value;

use crate::capture::eval;
use crate::error::Result;
use crate::page_session::PageSession;
use crate::wait::wait_for_function;

/// Polls `expression` before the step's own action runs. Its timeout counts
/// against the step deadline; failure aborts the step.
pub async fn run_ready_when(session: &PageSession, expression: &str, timeout: Duration) -> Result<()> {
    wait_for_function(session, expression, timeout).await
}

/// Polls `expression` after the action. Expiry is non-fatal: the caller
/// should attach the returned warning rather than fail the step.
pub async fn run_settled_when(session: &PageSession, expression: &str, timeout: Duration) -> Option<String> {
    match wait_for_function(session, expression, timeout).await {
        Ok(()) => None,
        Err(_) => Some("settledWhen timed out".to_string()),
    }
}

/// Evaluates `expression` once after the action and serializes the result for
/// attachment to the step's `observation` field.
pub async fn run_observe(session: &PageSession, expression: &str) -> Result<Value> {
    let envelope = eval::evaluate_and_serialize(session, expression).await?;
    Ok(eval::process_result(&envelope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settled_when_failure_is_a_warning_not_an_error() {
        // No live session: wait_for_function's remote eval will fail immediately
        // via a connection error, which run_settled_when must still map to a
        // warning rather than propagate.
        use crate::transport::Transport;
        use std::sync::Arc;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                // Accept then immediately drop, forcing every send to time out/fail.
                let _ = tokio_tungstenite::accept_async(stream).await;
            }
        });
        let transport = Arc::new(Transport::connect(&format!("ws://{addr}")).await.unwrap());
        let session = PageSession::new(transport, "s1".into(), "t1".into());

        let warning = run_settled_when(&session, "true", Duration::from_millis(50)).await;
        assert_eq!(warning.as_deref(), Some("settledWhen timed out"));
    }
}
