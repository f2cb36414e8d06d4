//! Error aggregator: merges console and network captures into summaries and
//! reports. Requires both captures at construction — it has no standalone data.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use super::console::{ConsoleCapture, Level as ConsoleLevel};
use super::network::{NetworkCapture, NetworkErrorKind};

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub console_messages: usize,
    pub console_errors: usize,
    pub console_warnings: usize,
    pub network_errors: usize,
    pub has_errors: bool,
    pub has_warnings: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ChronologicalError {
    Console { level: ConsoleLevel, text: String, timestamp: chrono::DateTime<Utc> },
    Network { kind: NetworkErrorKind, url: String, detail: String, timestamp: chrono::DateTime<Utc> },
}

impl ChronologicalError {
    fn timestamp(&self) -> chrono::DateTime<Utc> {
        match self {
            Self::Console { timestamp, .. } => *timestamp,
            Self::Network { timestamp, .. } => *timestamp,
        }
    }
}

pub struct ErrorAggregator {
    console: Arc<ConsoleCapture>,
    network: Arc<NetworkCapture>,
}

impl ErrorAggregator {
    pub fn new(console: Arc<ConsoleCapture>, network: Arc<NetworkCapture>) -> Self {
        Self { console, network }
    }

    pub async fn get_summary(&self) -> Summary {
        let messages = self.console.messages().await;
        let network_errors = self.network.errors().await;
        let console_errors = messages.iter().filter(|m| m.level == ConsoleLevel::Error).count();
        let console_warnings = messages.iter().filter(|m| m.level == ConsoleLevel::Warning).count();

        Summary {
            console_messages: messages.len(),
            console_errors,
            console_warnings,
            network_errors: network_errors.len(),
            has_errors: console_errors > 0 || !network_errors.is_empty(),
            has_warnings: console_warnings > 0,
        }
    }

    pub async fn get_all_errors_chronological(&self) -> Vec<ChronologicalError> {
        let mut all: Vec<ChronologicalError> = self
            .console
            .messages()
            .await
            .into_iter()
            .filter(|m| m.level == ConsoleLevel::Error)
            .map(|m| ChronologicalError::Console { level: m.level, text: m.text, timestamp: m.timestamp })
            .collect();

        all.extend(self.network.errors().await.into_iter().map(|e| ChronologicalError::Network {
            kind: e.kind,
            url: e.url,
            detail: e.detail,
            timestamp: e.timestamp,
        }));

        all.sort_by_key(|e| e.timestamp());
        all
    }

    /// Uncaught exceptions ∪ network-failures ∪ HTTP-5xx.
    pub async fn get_critical_errors(&self) -> Vec<ChronologicalError> {
        let console_exceptions: Vec<ChronologicalError> = self
            .console
            .messages()
            .await
            .into_iter()
            .filter(|m| m.source == "exception")
            .map(|m| ChronologicalError::Console { level: m.level, text: m.text, timestamp: m.timestamp })
            .collect();

        let network_critical: Vec<ChronologicalError> = self
            .network
            .errors()
            .await
            .into_iter()
            .filter(|e| matches!(e.kind, NetworkErrorKind::NetworkFailure | NetworkErrorKind::HttpServerError))
            .map(|e| ChronologicalError::Network { kind: e.kind, url: e.url, detail: e.detail, timestamp: e.timestamp })
            .collect();

        let mut all = console_exceptions;
        all.extend(network_critical);
        all.sort_by_key(|e| e.timestamp());
        all
    }

    pub async fn format_report(&self) -> String {
        let summary = self.get_summary().await;
        let mut report = format!(
            "console: {} messages ({} errors, {} warnings); network: {} errors\n",
            summary.console_messages, summary.console_errors, summary.console_warnings, summary.network_errors
        );
        for error in self.get_all_errors_chronological().await {
            match error {
                ChronologicalError::Console { level, text, .. } => {
                    report.push_str(&format!("[console:{level:?}] {text}\n"));
                }
                ChronologicalError::Network { kind, url, detail, .. } => {
                    report.push_str(&format!("[network:{kind:?}] {url}: {detail}\n"));
                }
            }
        }
        report
    }

    pub async fn to_json(&self) -> Value {
        json!({
            "summary": self.get_summary().await,
            "criticalErrors": self.get_critical_errors().await,
            "generatedAt": Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summary_has_errors_reflects_console_and_network() {
        let console = Arc::new(ConsoleCapture::new(100));
        let network = Arc::new(NetworkCapture::new(vec![]));
        let aggregator = ErrorAggregator::new(console, network);
        let summary = aggregator.get_summary().await;
        assert!(!summary.has_errors);
        assert!(!summary.has_warnings);
    }
}
