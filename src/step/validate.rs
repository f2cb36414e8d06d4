//! Step-list validation. Total and pure: same input always yields the same
//! `{valid, errors}` and performs no side effects (spec §8 invariant 6).

use serde::Serialize;
use serde_json::Value;

use super::{Step, ACTION_KEYS, HOOK_KEYS};
use crate::resolve::ElementRef;

static SNAPSHOT_REF_PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

fn snapshot_ref_pattern() -> &'static regex::Regex {
    SNAPSHOT_REF_PATTERN.get_or_init(|| regex::Regex::new(r"^s\d+e\d+$").unwrap())
}

#[derive(Debug, Clone, Serialize)]
pub struct StepValidationError {
    pub index: usize,
    pub step: Value,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<StepValidationError>,
}

/// Parses the union of element-reference shapes §3 describes: a bare
/// selector string, or an object carrying `selector` | `ref` | `text` |
/// `label` | `role`/`name` | `x`+`y` | a `selectors` fallback list.
pub fn parse_element_ref(value: &Value) -> Option<ElementRef> {
    match value {
        Value::String(s) => Some(ElementRef::Selector(s.clone())),
        Value::Object(map) => {
            if let Some(list) = map.get("selectors").and_then(|v| v.as_array()) {
                let candidates: Vec<ElementRef> = list.iter().filter_map(parse_element_ref).collect();
                if !candidates.is_empty() {
                    return Some(ElementRef::Fallback(candidates));
                }
            }
            if let Some(s) = map.get("selector").and_then(|v| v.as_str()) {
                return Some(ElementRef::Selector(s.to_string()));
            }
            if let Some(r) = map.get("ref").and_then(|v| v.as_str()) {
                return Some(ElementRef::SnapshotRef(r.to_string()));
            }
            if let Some(t) = map.get("text").and_then(|v| v.as_str()) {
                let exact = map.get("exact").and_then(|v| v.as_bool()).unwrap_or(false);
                return Some(ElementRef::Text { text: t.to_string(), exact });
            }
            if let Some(label) = map.get("label").and_then(|v| v.as_str()) {
                return Some(ElementRef::Text { text: label.to_string(), exact: false });
            }
            if map.contains_key("role") || map.contains_key("name") {
                let role = map.get("role").and_then(|v| v.as_str()).map(String::from);
                let name = map.get("name").and_then(|v| v.as_str()).map(String::from);
                return Some(ElementRef::RoleName { role, name });
            }
            if let (Some(x), Some(y)) = (
                map.get("x").and_then(|v| v.as_f64()),
                map.get("y").and_then(|v| v.as_f64()),
            ) {
                return Some(ElementRef::Coordinates { x, y });
            }
            None
        }
        _ => None,
    }
}

fn require_element_ref(value: &Value, errors: &mut Vec<String>, action: &str) {
    match parse_element_ref(value) {
        Some(ElementRef::Selector(s)) if s.trim().is_empty() => {
            errors.push(format!("{action}: selector must not be empty"));
        }
        Some(ElementRef::SnapshotRef(r)) if !snapshot_ref_pattern().is_match(&r) => {
            errors.push(format!("{action}: ref must match s{{N}}e{{M}}, got {r:?}"));
        }
        Some(_) => {}
        None => errors.push(format!(
            "{action}: requires one of selector, ref, text, role+name, x+y, or selectors[]"
        )),
    }
}

fn require_nonnegative_xy(value: &Value, errors: &mut Vec<String>, action: &str) {
    if let Value::Object(map) = value {
        for key in ["x", "y"] {
            if let Some(n) = map.get(key).and_then(|v| v.as_f64()) {
                if n < 0.0 {
                    errors.push(format!("{action}: {key} must be non-negative, got {n}"));
                }
            }
        }
    }
}

fn require_nonempty_string(value: &Value, field: &str, errors: &mut Vec<String>, action: &str) {
    match value {
        Value::String(s) if !s.trim().is_empty() => {}
        Value::String(_) => errors.push(format!("{action}: {field} must not be empty")),
        _ => errors.push(format!("{action}: {field} must be a string")),
    }
}

fn validate_shape(action: &str, value: &Value, errors: &mut Vec<String>) {
    match action {
        "goto" => match value {
            Value::String(s) if !s.trim().is_empty() => {}
            Value::Object(map) => match map.get("url") {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                _ => errors.push("goto: requires a non-empty url".to_string()),
            },
            _ => errors.push("goto: requires a non-empty url string".to_string()),
        },
        "click" | "hover" | "getBox" => {
            require_element_ref(value, errors, action);
            require_nonnegative_xy(value, errors, action);
        }
        "fill" | "type" => match value {
            Value::Object(map) => {
                if map.get("value").and_then(|v| v.as_str()).is_none()
                    && action == "fill"
                {
                    errors.push(format!("{action}: requires a string value"));
                }
                if action == "type" && map.get("text").and_then(|v| v.as_str()).is_none() {
                    errors.push(format!("{action}: requires a string text"));
                }
                let has_target = map.contains_key("selector") || map.contains_key("ref") || map.contains_key("label");
                if !has_target {
                    errors.push(format!("{action}: requires one of selector, ref, label"));
                }
            }
            _ => errors.push(format!("{action}: requires an object with a target and value")),
        },
        "select" | "selectOption" => match value {
            Value::Object(map) => {
                require_element_ref(value, errors, action);
                if !map.contains_key("value") && !map.contains_key("values") {
                    errors.push(format!("{action}: requires value or values"));
                }
            }
            _ => errors.push(format!("{action}: requires an object with a target and value")),
        },
        "press" => require_nonempty_string(value, "combo", errors, action),
        "query" | "queryAll" => require_element_ref(value, errors, action),
        "viewport" => match value {
            Value::Object(map) => {
                let width = map.get("width").and_then(|v| v.as_f64());
                let height = map.get("height").and_then(|v| v.as_f64());
                match (width, height) {
                    (Some(w), Some(h)) if w > 0.0 && h > 0.0 => {}
                    _ => errors.push("viewport: requires positive width and height".to_string()),
                }
            }
            _ => errors.push("viewport: requires an object with width and height".to_string()),
        },
        "assert" => {
            if !matches!(value, Value::Object(m) if !m.is_empty()) {
                errors.push("assert: requires a non-empty assertion object".to_string());
            }
        }
        "scroll" => {
            require_nonnegative_xy(value, errors, action);
            if let Value::Object(map) = value {
                if !map.contains_key("deltaX") && !map.contains_key("deltaY") && parse_element_ref(value).is_none() {
                    errors.push("scroll: requires deltaX/deltaY or a target".to_string());
                }
            }
        }
        "drag" => match value {
            Value::Object(map) => {
                if map.get("from").is_none() || map.get("to").is_none() {
                    errors.push("drag: requires from and to points".to_string());
                }
            }
            _ => errors.push("drag: requires an object with from and to".to_string()),
        },
        "eval" | "pageFunction" | "extract" => require_nonempty_string(value, "fn", errors, action),
        "poll" => match value {
            Value::Object(map) => {
                if map.get("fn").and_then(|v| v.as_str()).is_none() {
                    errors.push("poll: requires a string fn".to_string());
                }
            }
            _ => errors.push("poll: requires an object with fn".to_string()),
        },
        "pipeline" => match value {
            Value::Array(ops) if !ops.is_empty() => {}
            _ => errors.push("pipeline: requires a non-empty array of micro-ops".to_string()),
        },
        "writeSiteProfile" => match value {
            Value::Object(map) => {
                if map.get("content").and_then(|v| v.as_str()).is_none() {
                    errors.push("writeSiteProfile: requires a string content".to_string());
                }
            }
            _ => errors.push("writeSiteProfile: requires an object with content".to_string()),
        },
        "screenshot" => {
            if let Value::Object(map) = value {
                if let Some(format) = map.get("format").and_then(|v| v.as_str()) {
                    if !["png", "jpeg", "webp"].contains(&format) {
                        errors.push(format!("screenshot: unknown format {format:?}"));
                    }
                    if let Some(q) = map.get("quality").and_then(|v| v.as_i64()) {
                        if format == "png" {
                            errors.push("screenshot: quality is not accepted for png".to_string());
                        } else if !(0..=100).contains(&q) {
                            errors.push("screenshot: quality must be in [0,100]".to_string());
                        }
                    }
                }
            }
        }
        "refAt" => require_element_ref(value, errors, action),
        "elementsAt" | "elementsNear" => require_nonnegative_xy(value, errors, action),
        "switchToFrame" => {
            if parse_element_ref(value).is_none() && !matches!(value, Value::Object(m) if m.contains_key("frameId")) {
                errors.push("switchToFrame: requires a selector or frameId".to_string());
            }
        }
        "cookies" | "console" | "network" | "snapshot" | "switchToMainFrame" | "listFrames" | "listTabs"
        | "openTab" | "closeTab" | "back" | "forward" | "waitForNavigation" | "inspect" | "wait" | "fillForm" => {}
        _ => {}
    }
}

fn validate_hooks(step: &Step, errors: &mut Vec<String>) {
    for key in HOOK_KEYS {
        if let Some(value) = step.get(key) {
            if !matches!(value, Value::String(s) if !s.trim().is_empty()) {
                errors.push(format!("{key}: must be a non-empty function-string"));
            }
        }
    }
}

/// Validates every step up front. A single ambiguous or unrecognized action
/// key is fatal for that step; shape errors accumulate per step rather than
/// short-circuiting so a caller sees every problem in one pass.
pub fn validate(steps: &[Step]) -> ValidationReport {
    let mut report_errors = Vec::new();

    for (index, step) in steps.iter().enumerate() {
        let mut errors = Vec::new();
        let present = step.action_keys_present();

        if present.is_empty() {
            errors.push(format!(
                "no recognized action key; expected one of {}",
                ACTION_KEYS.join(", ")
            ));
        } else if present.len() > 1 {
            errors.push(format!(
                "ambiguous step: multiple action keys present: {}",
                present.join(", ")
            ));
        } else {
            let action = present[0];
            let value = step.get(action).cloned().unwrap_or(Value::Null);
            validate_shape(action, &value, &mut errors);
        }

        validate_hooks(step, &mut errors);

        if !errors.is_empty() {
            report_errors.push(StepValidationError {
                index,
                step: Value::Object(step.0.clone()),
                errors,
            });
        }
    }

    ValidationReport {
        valid: report_errors.is_empty(),
        errors: report_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: Value) -> Step {
        Step(value.as_object().unwrap().clone())
    }

    #[test]
    fn ambiguous_step_is_fatal() {
        let steps = vec![step(json!({ "click": "#btn", "fill": "#input" }))];
        let report = validate(&steps);
        assert!(!report.valid);
        assert!(report.errors[0].errors[0].contains("ambiguous"));
    }

    #[test]
    fn unknown_action_key_is_fatal() {
        let steps = vec![step(json!({ "teleport": "#btn" }))];
        let report = validate(&steps);
        assert!(!report.valid);
    }

    #[test]
    fn empty_click_selector_is_rejected() {
        let steps = vec![step(json!({ "click": "" }))];
        let report = validate(&steps);
        assert!(!report.valid);
        assert!(report.errors[0].errors[0].contains("empty"));
    }

    #[test]
    fn fill_requires_value_and_target() {
        let steps = vec![step(json!({ "fill": { "selector": "#input" } }))];
        let report = validate(&steps);
        assert!(!report.valid);
        assert!(report.errors[0].errors.iter().any(|e| e.contains("value")));
    }

    #[test]
    fn fill_with_value_and_selector_is_valid() {
        let steps = vec![step(json!({ "fill": { "selector": "#input", "value": "hi" } }))];
        let report = validate(&steps);
        assert!(report.valid);
    }

    #[test]
    fn press_requires_nonempty_string() {
        let steps = vec![step(json!({ "press": "" }))];
        let report = validate(&steps);
        assert!(!report.valid);
    }

    #[test]
    fn ref_must_match_fixed_pattern() {
        let steps = vec![step(json!({ "click": { "ref": "not-a-ref" } }))];
        let report = validate(&steps);
        assert!(!report.valid);
    }

    #[test]
    fn valid_ref_shape_passes() {
        let steps = vec![step(json!({ "click": { "ref": "s1e2" } }))];
        let report = validate(&steps);
        assert!(report.valid);
    }

    #[test]
    fn coordinate_steps_reject_negative_numbers() {
        let steps = vec![step(json!({ "click": { "x": -1.0, "y": 5.0 } }))];
        let report = validate(&steps);
        assert!(!report.valid);
    }

    #[test]
    fn validation_is_pure_and_total() {
        let steps = vec![step(json!({ "click": "#btn" }))];
        let first = validate(&steps);
        let second = validate(&steps);
        assert_eq!(first.valid, second.valid);
        assert_eq!(first.errors.len(), second.errors.len());
    }

    #[test]
    fn hook_keys_must_be_nonempty_function_strings() {
        let steps = vec![step(json!({ "click": "#btn", "readyWhen": "" }))];
        let report = validate(&steps);
        assert!(!report.valid);
    }

    #[test]
    fn screenshot_rejects_quality_on_png() {
        let steps = vec![step(json!({ "screenshot": { "format": "png", "quality": 80 } }))];
        let report = validate(&steps);
        assert!(!report.valid);
    }

    #[test]
    fn screenshot_rejects_out_of_range_quality() {
        let steps = vec![step(json!({ "screenshot": { "format": "jpeg", "quality": 150 } }))];
        let report = validate(&steps);
        assert!(!report.valid);
    }
}
