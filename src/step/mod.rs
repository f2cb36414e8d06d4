//! C11 — step executor: validation, dispatch, hooks, dynamic evaluation,
//! and the site-profile passthrough.

pub mod dynamic;
pub mod executor;
pub mod hooks;
pub mod site_profile;
pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A step is a raw JSON object; exactly one of its keys must be a recognized
/// action key (validated, not encoded structurally — the hook keys below are
/// legal siblings of the action key, which rules out a tagged-enum shape).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Step(pub Map<String, Value>);

/// The full action-key grammar (spec §3's Step union).
pub const ACTION_KEYS: &[&str] = &[
    "goto", "wait", "click", "hover", "fill", "fillForm", "press", "type", "select",
    "selectOption", "query", "queryAll", "snapshot", "viewport", "cookies", "console",
    "network", "assert", "scroll", "drag", "eval", "pageFunction", "poll", "pipeline",
    "writeSiteProfile", "screenshot", "refAt", "elementsAt", "elementsNear", "switchToFrame",
    "switchToMainFrame", "listFrames", "listTabs", "openTab", "closeTab", "back", "forward",
    "getBox", "waitForNavigation", "extract", "inspect",
];

/// Legal sibling keys alongside the one action key (not actions themselves).
pub const HOOK_KEYS: &[&str] = &["readyWhen", "settledWhen", "observe"];

impl Step {
    pub fn action_key(&self) -> Option<&str> {
        ACTION_KEYS.iter().find(|k| self.0.contains_key(**k)).copied()
    }

    pub fn action_keys_present(&self) -> Vec<&str> {
        ACTION_KEYS.iter().filter(|k| self.0.contains_key(**k)).copied().collect()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn hook(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub action: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<Value>,
    /// Only populated when `status == Error`, per spec §8 invariant 7.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Value>,
}

impl StepResult {
    pub fn ok(action: impl Into<String>, output: Value) -> Self {
        Self {
            action: action.into(),
            status: StepStatus::Ok,
            output: Some(output),
            error: None,
            warning: None,
            observation: None,
            params: None,
            site_profile: None,
            profile_available: None,
            profile_domain: None,
            diagnostics: None,
        }
    }

    pub fn error(action: impl Into<String>, message: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            status: StepStatus::Error,
            output: None,
            error: Some(message.into()),
            warning: None,
            observation: None,
            params: Some(params),
            site_profile: None,
            profile_available: None,
            profile_domain: None,
            diagnostics: None,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    pub fn with_observation(mut self, observation: Value) -> Self {
        self.observation = Some(observation);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Value) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunErrorEntry {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: StepStatus,
    pub steps: Vec<StepResult>,
    pub errors: Vec<RunErrorEntry>,
    pub screenshots: Vec<String>,
    pub summary: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_key_finds_the_one_recognized_key() {
        let step = Step(json!({ "click": "#btn" }).as_object().unwrap().clone());
        assert_eq!(step.action_key(), Some("click"));
    }

    #[test]
    fn action_keys_present_detects_ambiguity() {
        let step = Step(
            json!({ "click": "#btn", "fill": "#input" })
                .as_object()
                .unwrap()
                .clone(),
        );
        assert_eq!(step.action_keys_present().len(), 2);
    }

    #[test]
    fn hook_keys_are_not_action_keys() {
        for hook in HOOK_KEYS {
            assert!(!ACTION_KEYS.contains(hook));
        }
    }
}
