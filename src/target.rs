//! C3 — target registry: mirrors the remote target set in a local map.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Page,
    ServiceWorker,
    Other,
}

impl TargetType {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "page" => Self::Page,
            "service_worker" => Self::ServiceWorker,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub title: String,
    pub url: String,
    pub attached: bool,
}

impl TargetInfo {
    fn from_cdp(value: &Value) -> Option<Self> {
        Some(Self {
            target_id: value.get("targetId")?.as_str()?.to_string(),
            target_type: TargetType::from_raw(value.get("type")?.as_str().unwrap_or("other")),
            title: value.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            url: value.get("url").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            attached: value.get("attached").and_then(|v| v.as_bool()).unwrap_or(false),
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct NewTargetOptions {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub background: bool,
    pub new_window: bool,
}

/// Tracks the set of remote targets (tabs/workers), kept live by subscribing to
/// `Target.targetCreated` / `Target.targetInfoChanged` / `Target.targetDestroyed`
/// when discovery is enabled.
pub struct TargetRegistry {
    transport: Arc<Transport>,
    targets: RwLock<HashMap<String, TargetInfo>>,
}

impl TargetRegistry {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to target lifecycle events and seed the map from a one-time query.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let seeded: Value = self
            .transport
            .send("Target.getTargets", json!({}))
            .await?;
        if let Some(infos) = seeded.get("targetInfos").and_then(|v| v.as_array()) {
            let mut targets = self.targets.write().await;
            for info in infos {
                if let Some(t) = TargetInfo::from_cdp(info) {
                    targets.insert(t.target_id.clone(), t);
                }
            }
        }

        let registry = self.clone();
        self.transport
            .on("Target.targetCreated", move |params| {
                if let Some(info) = params.get("targetInfo").and_then(TargetInfo::from_cdp) {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        registry.targets.write().await.insert(info.target_id.clone(), info);
                    });
                }
            })
            .await;

        let registry = self.clone();
        self.transport
            .on("Target.targetInfoChanged", move |params| {
                if let Some(info) = params.get("targetInfo").and_then(TargetInfo::from_cdp) {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        registry.targets.write().await.insert(info.target_id.clone(), info);
                    });
                }
            })
            .await;

        let registry = self.clone();
        self.transport
            .on("Target.targetDestroyed", move |params| {
                if let Some(target_id) = params.get("targetId").and_then(|v| v.as_str()) {
                    let target_id = target_id.to_string();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        registry.targets.write().await.remove(&target_id);
                    });
                }
            })
            .await;

        Ok(())
    }

    pub async fn get(&self, target_id: &str) -> Option<TargetInfo> {
        self.targets.read().await.get(target_id).cloned()
    }

    /// Read-only snapshot copy of the cache.
    pub async fn list(&self) -> Vec<TargetInfo> {
        self.targets.read().await.values().cloned().collect()
    }

    pub async fn create(&self, opts: NewTargetOptions) -> Result<String> {
        let mut params = json!({ "url": opts.url });
        if let Some(w) = opts.width {
            params["width"] = json!(w);
        }
        if let Some(h) = opts.height {
            params["height"] = json!(h);
        }
        if opts.background {
            params["background"] = json!(true);
        }
        if opts.new_window {
            params["newWindow"] = json!(true);
        }
        let result: Value = self.transport.send("Target.createTarget", params).await?;
        result
            .get("targetId")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::protocol("Target.createTarget missing targetId"))
    }

    pub async fn close(&self, target_id: &str) -> Result<()> {
        self.transport
            .send::<Value>("Target.closeTarget", json!({ "targetId": target_id }))
            .await?;
        self.targets.write().await.remove(target_id);
        Ok(())
    }

    pub async fn activate(&self, target_id: &str) -> Result<()> {
        self.transport
            .send::<Value>("Target.activateTarget", json!({ "targetId": target_id }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_info_from_cdp_maps_known_types() {
        let page = json!({"targetId": "t1", "type": "page", "title": "Example", "url": "https://example.com", "attached": true});
        let info = TargetInfo::from_cdp(&page).unwrap();
        assert_eq!(info.target_type, TargetType::Page);
        assert!(info.attached);

        let worker = json!({"targetId": "t2", "type": "service_worker", "title": "", "url": ""});
        assert_eq!(TargetInfo::from_cdp(&worker).unwrap().target_type, TargetType::ServiceWorker);

        let other = json!({"targetId": "t3", "type": "iframe", "title": "", "url": ""});
        assert_eq!(TargetInfo::from_cdp(&other).unwrap().target_type, TargetType::Other);
    }

    #[test]
    fn target_info_from_cdp_requires_target_id() {
        let missing = json!({"type": "page", "title": "", "url": ""});
        assert!(TargetInfo::from_cdp(&missing).is_none());
    }
}
