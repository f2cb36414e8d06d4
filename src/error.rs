//! Structured error taxonomy for the core engine.
//!
//! Every error the executor surfaces to a caller carries one of these kinds,
//! per the vocabulary in spec §7. Local diagnostic failures (capture, best-effort
//! evaluations) are intentionally *not* routed through this type — they are
//! swallowed and logged at `debug!` instead.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub selector: Option<String>,
    pub timeout: Option<Duration>,
    pub object_id: Option<String>,
    pub operation: Option<String>,
    pub blocked_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("connection error")]
    Connection,
    #[error("navigation error")]
    Navigation,
    #[error("timed out")]
    Timeout,
    #[error("element not found")]
    ElementNotFound,
    #[error("stale element")]
    StaleElement,
    #[error("page crashed")]
    PageCrashed,
    #[error("execution context destroyed")]
    ContextDestroyed,
    #[error("step validation error")]
    StepValidation,
    #[error("discovery error")]
    Discovery,
    #[error("protocol error")]
    Protocol,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            selector: None,
            timeout: None,
            object_id: None,
            operation: None,
            blocked_by: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_blocked_by(mut self, blocked_by: impl Into<String>) -> Self {
        self.blocked_by = Some(blocked_by.into());
        self
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        let operation = operation.into();
        Self::new(ErrorKind::Timeout, format!("timed out: {}", operation))
            .with_operation(operation)
            .with_timeout(timeout)
    }

    pub fn element_not_found(selector: impl Into<String>) -> Self {
        let selector = selector.into();
        Self::new(ErrorKind::ElementNotFound, format!("Element not found: {}", selector))
            .with_selector(selector)
    }

    pub fn stale_element(object_id: impl Into<String>) -> Self {
        let object_id = object_id.into();
        Self::new(ErrorKind::StaleElement, "stale element reference").with_object_id(object_id)
    }

    pub fn step_validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StepValidation, message)
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Discovery, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Messages the remote runtime is known to emit when a remote object/node has
    /// gone stale. Fixed vocabulary per spec §4.7 — not open to extension.
    const STALE_OBJECT_MESSAGES: &'static [&'static str] = &[
        "Could not find object with given id",
        "Object reference not found",
        "Cannot find context with specified id",
        "Node with given id does not belong to the document",
        "No node with given id found",
        "Object is not available",
        "No object with given id",
        "Object with given id not found",
    ];

    /// Normalize a raw protocol error message: stale-object patterns become
    /// `STALE_ELEMENT`, everything else becomes `PROTOCOL`.
    pub fn from_protocol_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if Self::STALE_OBJECT_MESSAGES
            .iter()
            .any(|pat| message.contains(pat))
        {
            Self::new(ErrorKind::StaleElement, message)
        } else {
            Self::new(ErrorKind::Protocol, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_object_messages_normalize_to_stale_element() {
        for msg in Error::STALE_OBJECT_MESSAGES {
            let err = Error::from_protocol_message(*msg);
            assert_eq!(err.kind, ErrorKind::StaleElement, "message: {msg}");
        }
    }

    #[test]
    fn other_protocol_messages_stay_protocol() {
        let err = Error::from_protocol_message("Invalid parameters");
        assert_eq!(err.kind, ErrorKind::Protocol);
    }
}
