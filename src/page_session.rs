//! C5 — page session: a thin facade binding a session id to the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::transport::{SubscriptionId, Transport};

/// Binds `(transport, sessionId, targetId)` into a facade whose `send`/`on`/`off`
/// are session-scoped, and whose `dispose()` flips validity. Calls on a disposed
/// session fail with a stale-session error.
pub struct PageSession {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
    valid: AtomicBool,
}

impl PageSession {
    pub fn new(transport: Arc<Transport>, session_id: String, target_id: String) -> Self {
        Self {
            transport,
            session_id,
            target_id,
            valid: AtomicBool::new(true),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn check_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::connection(format!(
                "stale session: {}",
                self.session_id
            )))
        }
    }

    pub async fn send<R: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        self.check_valid()?;
        self.transport.send_session(&self.session_id, method, params).await
    }

    pub async fn on<F>(&self, event: &str, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.check_valid()?;
        let key = format!("{}:{}", self.session_id, event);
        Ok(self.transport.on(&key, callback).await)
    }

    pub async fn off(&self, event: &str, id: SubscriptionId) {
        let key = format!("{}:{}", self.session_id, event);
        self.transport.off(&key, id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn accept_once(listener: TcpListener) {
        if let Ok((stream, _)) = listener.accept().await {
            let _ = tokio_tungstenite::accept_async(stream).await;
        }
    }

    #[tokio::test]
    async fn dispose_flips_validity_and_blocks_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(accept_once(listener));

        let transport = Arc::new(
            Transport::connect(&format!("ws://{addr}"))
                .await
                .expect("connect to loopback server"),
        );
        let session = PageSession::new(transport, "s1".into(), "t1".into());

        assert!(session.is_valid());
        session.dispose();
        assert!(!session.is_valid());

        let err = session
            .send::<serde_json::Value>("Runtime.evaluate", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.message.contains("stale session"));
    }
}
