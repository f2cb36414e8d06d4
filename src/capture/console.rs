//! Console capture: `Runtime.consoleAPICalled` + `Runtime.exceptionThrown`
//! only. The deprecated `Console` domain stream is never enabled — enabling
//! both would duplicate every message.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::page_session::PageSession;
use crate::transport::SubscriptionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Log,
    Debug,
    Info,
    Warning,
    Error,
}

/// Fixed type table: log/dir/table/trace→log; debug→debug; info→info;
/// warn/warning→warning; error/assert→error.
fn level_for_console_type(console_type: &str) -> Level {
    match console_type {
        "log" | "dir" | "table" | "trace" => Level::Log,
        "debug" => Level::Debug,
        "info" => Level::Info,
        "warn" | "warning" => Level::Warning,
        "error" | "assert" => Level::Error,
        _ => Level::Log,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleMessage {
    pub level: Level,
    pub text: String,
    pub source: &'static str,
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    buffer: VecDeque<ConsoleMessage>,
    max_messages: usize,
}

pub struct ConsoleCapture {
    inner: Arc<Mutex<Inner>>,
}

fn format_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| {
            arg.get("value")
                .and_then(|v| v.as_str().map(String::from))
                .or_else(|| arg.get("description").and_then(|v| v.as_str().map(String::from)))
                .unwrap_or_else(|| arg.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl ConsoleCapture {
    pub fn new(max_messages: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: VecDeque::with_capacity(max_messages.min(4096)),
                max_messages,
            })),
        }
    }

    async fn push(&self, message: ConsoleMessage) {
        let mut inner = self.inner.lock().await;
        let max = inner.max_messages;
        inner.buffer.push_back(message);
        while inner.buffer.len() > max {
            inner.buffer.pop_front();
        }
    }

    pub async fn messages(&self) -> Vec<ConsoleMessage> {
        self.inner.lock().await.buffer.iter().cloned().collect()
    }

    /// Subscribes both event types. Returns the subscription ids so the
    /// caller can detach them on teardown.
    pub async fn start(self: &Arc<Self>, session: &PageSession) -> Result<(SubscriptionId, SubscriptionId)> {
        let capture = self.clone();
        let console_sub = session
            .on("Runtime.consoleAPICalled", move |params| {
                let capture = capture.clone();
                let console_type = params.get("type").and_then(|v| v.as_str()).unwrap_or("log").to_string();
                let args: Vec<Value> = params
                    .get("args")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                tokio::spawn(async move {
                    capture
                        .push(ConsoleMessage {
                            level: level_for_console_type(&console_type),
                            text: format_args(&args),
                            source: "console",
                            timestamp: Utc::now(),
                        })
                        .await;
                });
            })
            .await?;

        let capture = self.clone();
        let exception_sub = session
            .on("Runtime.exceptionThrown", move |params| {
                let capture = capture.clone();
                let text = params
                    .get("exceptionDetails")
                    .and_then(|d| d.get("exception"))
                    .and_then(|e| e.get("description").or_else(|| e.get("value")))
                    .and_then(|v| v.as_str())
                    .unwrap_or("uncaught exception")
                    .to_string();
                tokio::spawn(async move {
                    capture
                        .push(ConsoleMessage {
                            level: Level::Error,
                            text,
                            source: "exception",
                            timestamp: Utc::now(),
                        })
                        .await;
                });
            })
            .await?;

        Ok((console_sub, exception_sub))
    }

    pub async fn stop(&self, session: &PageSession, subs: (SubscriptionId, SubscriptionId)) {
        session.off("Runtime.consoleAPICalled", subs.0).await;
        session.off("Runtime.exceptionThrown", subs.1).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_type_table_matches_fixed_mapping() {
        assert_eq!(level_for_console_type("log"), Level::Log);
        assert_eq!(level_for_console_type("dir"), Level::Log);
        assert_eq!(level_for_console_type("table"), Level::Log);
        assert_eq!(level_for_console_type("trace"), Level::Log);
        assert_eq!(level_for_console_type("debug"), Level::Debug);
        assert_eq!(level_for_console_type("info"), Level::Info);
        assert_eq!(level_for_console_type("warn"), Level::Warning);
        assert_eq!(level_for_console_type("warning"), Level::Warning);
        assert_eq!(level_for_console_type("error"), Level::Error);
        assert_eq!(level_for_console_type("assert"), Level::Error);
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest_past_capacity() {
        let capture = ConsoleCapture::new(2);
        for i in 0..5 {
            capture
                .push(ConsoleMessage {
                    level: Level::Log,
                    text: format!("msg {i}"),
                    source: "console",
                    timestamp: Utc::now(),
                })
                .await;
        }
        let messages = capture.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "msg 3");
        assert_eq!(messages[1].text, "msg 4");
    }
}
