//! C4 — session registry: maps target -> session, deduplicates concurrent
//! attach requests, reacts to external detach/destroy.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::transport::{SubscriptionId, Transport};

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub target_id: String,
    pub attached: bool,
}

/// Tracks `sessionId -> {targetId, attached}` and `targetId -> sessionId`, plus a
/// `targetId -> pending-attach` deduplication map so concurrent `attach(t)` calls
/// collapse onto one in-flight request.
pub struct SessionRegistry {
    transport: Arc<Transport>,
    by_session: RwLock<HashMap<String, SessionEntry>>,
    by_target: RwLock<HashMap<String, String>>,
    pending_attach: Mutex<HashMap<String, broadcast::Sender<Result<String>>>>,
    /// `(event, subscription)` pairs installed by `start()`, unsubscribed by `cleanup()`.
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            by_session: RwLock::new(HashMap::new()),
            by_target: RwLock::new(HashMap::new()),
            pending_attach: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to attach/detach/destroy notifications. Call once at startup.
    pub async fn start(self: &Arc<Self>) {
        let mut subscriptions = Vec::new();

        let registry = self.clone();
        let id = self
            .transport
            .on("Target.attachedToTarget", move |params| {
                let (Some(session_id), Some(target_id)) = (
                    params.get("sessionId").and_then(|v| v.as_str()),
                    params.get("targetInfo").and_then(|t| t.get("targetId")).and_then(|v| v.as_str()),
                ) else {
                    return;
                };
                let (session_id, target_id) = (session_id.to_string(), target_id.to_string());
                let registry = registry.clone();
                tokio::spawn(async move { registry.register_implicit_attach(session_id, target_id).await });
            })
            .await;
        subscriptions.push(("Target.attachedToTarget", id));

        let registry = self.clone();
        let id = self
            .transport
            .on("Target.detachedFromTarget", move |params| {
                if let Some(session_id) = params.get("sessionId").and_then(|v| v.as_str()) {
                    let session_id = session_id.to_string();
                    let registry = registry.clone();
                    tokio::spawn(async move { registry.remove_mappings(&session_id).await });
                }
            })
            .await;
        subscriptions.push(("Target.detachedFromTarget", id));

        let registry = self.clone();
        let id = self
            .transport
            .on("Target.targetDestroyed", move |params| {
                if let Some(target_id) = params.get("targetId").and_then(|v| v.as_str()) {
                    let target_id = target_id.to_string();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Some(session_id) = registry.by_target.read().await.get(&target_id).cloned() {
                            registry.remove_mappings(&session_id).await;
                        }
                    });
                }
            })
            .await;
        subscriptions.push(("Target.targetDestroyed", id));

        *self.subscriptions.lock().await = subscriptions;
    }

    async fn register_implicit_attach(&self, session_id: String, target_id: String) {
        self.by_session.write().await.insert(
            session_id.clone(),
            SessionEntry {
                target_id: target_id.clone(),
                attached: true,
            },
        );
        self.by_target.write().await.insert(target_id, session_id);
    }

    async fn remove_mappings(&self, session_id: &str) {
        let target_id = self.by_session.write().await.remove(session_id).map(|e| e.target_id);
        if let Some(target_id) = target_id {
            self.by_target.write().await.remove(&target_id);
        }
    }

    /// Attach semantics (spec §4.4):
    /// 1. Existing session for the target -> return it.
    /// 2. In-flight attach for the target -> return that pending result.
    /// 3. Otherwise issue exactly one attach request (`flatten=true`).
    pub async fn attach(self: &Arc<Self>, target_id: &str) -> Result<String> {
        if let Some(session_id) = self.by_target.read().await.get(target_id).cloned() {
            return Ok(session_id);
        }

        let mut rx = {
            let mut pending = self.pending_attach.lock().await;
            if let Some(tx) = pending.get(target_id) {
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                pending.insert(target_id.to_string(), tx);
                drop(pending);
                return self.do_attach(target_id).await;
            }
        };

        rx.recv()
            .await
            .map_err(|_| Error::connection("attach: pending channel closed"))?
    }

    async fn do_attach(self: &Arc<Self>, target_id: &str) -> Result<String> {
        let result = self.issue_attach(target_id).await;

        if let Some(tx) = self.pending_attach.lock().await.remove(target_id) {
            let _ = tx.send(clone_result(&result));
        }

        result
    }

    async fn issue_attach(&self, target_id: &str) -> Result<String> {
        let response: Value = self
            .transport
            .send(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = response
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::protocol("Target.attachToTarget missing sessionId"))?
            .to_string();

        self.by_session.write().await.insert(
            session_id.clone(),
            SessionEntry {
                target_id: target_id.to_string(),
                attached: true,
            },
        );
        self.by_target.write().await.insert(target_id.to_string(), session_id.clone());

        Ok(session_id)
    }

    pub async fn detach(&self, session_id: &str) -> Result<()> {
        let target_id = self.by_session.write().await.remove(session_id).map(|e| e.target_id);
        let Some(target_id) = target_id else {
            return Ok(());
        };
        self.by_target.write().await.remove(&target_id);
        self.transport
            .send::<Value>("Target.detachFromTarget", json!({ "sessionId": session_id }))
            .await?;
        Ok(())
    }

    pub async fn detach_by_target(&self, target_id: &str) -> Result<()> {
        let session_id = self.by_target.write().await.remove(target_id);
        let Some(session_id) = session_id else {
            return Ok(());
        };
        self.by_session.write().await.remove(&session_id);
        self.transport
            .send::<Value>("Target.detachFromTarget", json!({ "sessionId": session_id }))
            .await?;
        Ok(())
    }

    pub async fn detach_all(&self) {
        let sessions: Vec<String> = self.by_session.read().await.keys().cloned().collect();
        let futures = sessions.iter().map(|s| self.detach(s));
        let _ = futures::future::join_all(futures).await;
    }

    pub async fn session_for_target(&self, target_id: &str) -> Option<String> {
        self.by_target.read().await.get(target_id).cloned()
    }

    pub async fn is_valid(&self, session_id: &str) -> bool {
        self.by_session
            .read()
            .await
            .get(session_id)
            .map(|e| e.attached)
            .unwrap_or(false)
    }

    /// Unsubscribes all handlers installed by `start()` and clears all maps
    /// (spec §4.4).
    pub async fn cleanup(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for (event, id) in subscriptions {
            self.transport.off(event, id).await;
        }
        self.by_session.write().await.clear();
        self.by_target.write().await.clear();
        self.pending_attach.lock().await.clear();
    }
}

fn clone_result(result: &Result<String>) -> Result<String> {
    match result {
        Ok(s) => Ok(s.clone()),
        Err(e) => Err(Error::new(e.kind, e.message.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_result_preserves_kind_and_message() {
        let original: Result<String> = Err(Error::connection("boom"));
        let cloned = clone_result(&original);
        assert!(cloned.is_err());
        assert_eq!(cloned.unwrap_err().message, "boom");
    }
}
