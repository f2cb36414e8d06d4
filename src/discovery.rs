//! C2 — endpoint discovery over the small HTTP surface the remote debugger exposes.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "Protocol-Version")]
    pub protocol_version: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: Option<String>,
}

pub struct Discovery {
    client: reqwest::Client,
    base_url: String,
}

impl Discovery {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{host}:{port}"),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, deadline: Duration) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let fut = self.client.get(&url).send();
        let response = tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| Error::discovery(format!("discovery timed out: GET {url}")))?
            .map_err(|e| Error::discovery(format!("GET {url} failed: {e}")))?;

        let body = response
            .text()
            .await
            .map_err(|e| Error::discovery(format!("failed to read body from {url}: {e}")))?;

        serde_json::from_str(&body)
            .map_err(|e| Error::discovery(format!("failed to parse response from {url}: {e}")))
    }

    pub async fn get_version(&self, deadline: Duration) -> Result<VersionInfo> {
        self.get_json("/json/version", deadline).await
    }

    pub async fn get_targets(&self, deadline: Duration) -> Result<Vec<DiscoveredTarget>> {
        self.get_json("/json/list", deadline).await
    }

    /// Filters `type=page` targets by a regex or plain substring match against the URL.
    pub async fn find_page_by_url(&self, pattern: &str, deadline: Duration) -> Result<Option<DiscoveredTarget>> {
        let targets = self.get_targets(deadline).await?;
        let matcher = regex::Regex::new(pattern).ok();

        Ok(targets.into_iter().find(|t| {
            if t.target_type != "page" {
                return false;
            }
            match &matcher {
                Some(re) => re.is_match(&t.url),
                None => t.url.contains(pattern),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        port
    }

    #[tokio::test]
    async fn get_version_parses_fixed_fields() {
        let body = r#"{"Browser":"Chrome/120.0","Protocol-Version":"1.3","webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/browser/abc"}"#;
        let port = serve_once(body).await;
        let discovery = Discovery::new("127.0.0.1", port);
        let version = discovery.get_version(Duration::from_secs(2)).await.unwrap();
        assert_eq!(version.browser, "Chrome/120.0");
        assert_eq!(version.web_socket_debugger_url, "ws://127.0.0.1:9222/devtools/browser/abc");
    }

    #[tokio::test]
    async fn find_page_by_url_filters_by_type_and_pattern() {
        let body = r#"[
            {"id":"1","type":"page","title":"Example","url":"https://example.com/","webSocketDebuggerUrl":"ws://x/1"},
            {"id":"2","type":"service_worker","title":"sw","url":"https://example.com/sw.js"}
        ]"#;
        let port = serve_once(body).await;
        let discovery = Discovery::new("127.0.0.1", port);
        let found = discovery
            .find_page_by_url("example", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, "1");
    }

    #[tokio::test]
    async fn discovery_times_out_against_unreachable_port() {
        let discovery = Discovery::new("127.0.0.1", 1);
        let result = discovery.get_version(Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
