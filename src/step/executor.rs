//! C11 — step executor. Validates a step list up front, then dispatches each
//! step to a handler, wraps it in a per-step timeout, applies hooks, and
//! aggregates failure diagnostics. Owns nothing about the transport itself —
//! it drives C5 through C10 against one already-attached page session.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};

use crate::actionability::{self, ActionKind, Point, ScrollOptions, WaitOptions};
use crate::capture::console::ConsoleCapture;
use crate::capture::eval;
use crate::capture::errors::ErrorAggregator;
use crate::capture::network::NetworkCapture;
use crate::capture::screenshot::{self, Format, Mode, Rect, ScreenshotOptions};
use crate::config::{clamp_timeout_ms, RunConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::input;
use crate::page_session::PageSession;
use crate::resolve::{self, ElementRef};
use crate::session::SessionRegistry;
use crate::target::{NewTargetOptions, TargetRegistry};

use super::dynamic;
use super::hooks;
use super::site_profile;
use super::validate;
use super::{RunErrorEntry, RunReport, Step, StepResult, StepStatus};

/// Drives one attached page session through an ordered step list.
pub struct StepExecutor {
    page: Arc<PageSession>,
    target_registry: Arc<TargetRegistry>,
    session_registry: Arc<SessionRegistry>,
    config: RunConfig,
    console: Arc<ConsoleCapture>,
    network: Arc<NetworkCapture>,
    error_aggregator: ErrorAggregator,
    /// `contextId` pushed by `switchToFrame`, cleared by `switchToMainFrame`.
    /// Only the `eval`/`extract` paths honor it (spec §9 Open Question (a)).
    frame_context: tokio::sync::Mutex<Option<i64>>,
}

impl StepExecutor {
    pub fn new(
        page: Arc<PageSession>,
        target_registry: Arc<TargetRegistry>,
        session_registry: Arc<SessionRegistry>,
        config: RunConfig,
        console: Arc<ConsoleCapture>,
        network: Arc<NetworkCapture>,
    ) -> Self {
        let error_aggregator = ErrorAggregator::new(console.clone(), network.clone());
        Self {
            page,
            target_registry,
            session_registry,
            config,
            console,
            network,
            error_aggregator,
            frame_context: tokio::sync::Mutex::new(None),
        }
    }

    fn session(&self) -> &PageSession {
        &self.page
    }

    /// Validates the whole list up front (spec §8 invariant 6); on failure
    /// raises before any step runs and before any side effect. Runs steps in
    /// order; on a step error, remaining steps are dropped when
    /// `stop_on_error` and the run status becomes `error`.
    pub async fn run(&self, steps: &[Step], stop_on_error: bool) -> Result<RunReport> {
        let validation = validate::validate(steps);
        if !validation.valid {
            return Err(Error::step_validation(format!(
                "{} of {} step(s) failed validation",
                validation.errors.len(),
                steps.len()
            )));
        }

        let mut results = Vec::with_capacity(steps.len());
        let mut errors = Vec::new();
        let mut screenshots = Vec::new();
        let mut status = StepStatus::Ok;

        for (index, step) in steps.iter().enumerate() {
            let result = self.run_one(step).await;
            let is_error = result.status == StepStatus::Error;
            if is_error {
                status = StepStatus::Error;
                errors.push(RunErrorEntry {
                    index,
                    error: result.error.clone().unwrap_or_default(),
                });
            }
            if result.action == "screenshot" {
                if let Some(data) = result
                    .output
                    .as_ref()
                    .and_then(|o| o.get("data"))
                    .and_then(|v| v.as_str())
                {
                    screenshots.push(data.to_string());
                }
            }
            results.push(result);
            if is_error && stop_on_error {
                break;
            }
        }

        let summary = self.error_aggregator.to_json().await;
        Ok(RunReport {
            status,
            steps: results,
            errors,
            screenshots,
            summary,
        })
    }

    async fn run_one(&self, step: &Step) -> StepResult {
        let Some(action) = step.action_key() else {
            return StepResult::error("unknown", "no recognized action key", Value::Object(step.0.clone()));
        };
        let value = step.get(action).cloned().unwrap_or(Value::Null);
        let step_timeout = self.action_timeout(&value);

        match tokio::time::timeout(step_timeout, self.dispatch_with_hooks(step, action, &value)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => self.to_error_result(action, step, err).await,
            Err(_) => self.to_error_result(action, step, Error::timeout(action, step_timeout)).await,
        }
    }

    async fn dispatch_with_hooks(&self, step: &Step, action: &str, value: &Value) -> Result<StepResult> {
        if let Some(ready) = step.hook("readyWhen") {
            hooks::run_ready_when(self.session(), ready, self.config.step_timeout).await?;
        }

        let mut result = self.dispatch(action, value).await?;

        if let Some(settled) = step.hook("settledWhen") {
            if let Some(warning) = hooks::run_settled_when(self.session(), settled, self.config.step_timeout).await {
                result = result.with_warning(warning);
            }
        }

        if let Some(observe) = step.hook("observe") {
            let observation = hooks::run_observe(self.session(), observe).await?;
            result = result.with_observation(observation);
        }

        Ok(result)
    }

    /// Best-effort failure diagnostics: each sub-capture independently
    /// catches errors and contributes `null`/`[]`, never aborting the bundle.
    async fn capture_diagnostics(&self) -> Value {
        let title = self.eval_diagnostic("document.title").await;
        let url = self.eval_diagnostic("document.location.href").await;
        let visible_buttons = self
            .eval_diagnostic_array(
                "Array.from(document.querySelectorAll('button, [role=\"button\"]')).filter(el => el.offsetParent !== null).map(el => (el.textContent||'').trim()).slice(0,20)",
            )
            .await;
        let visible_links = self
            .eval_diagnostic_array(
                "Array.from(document.querySelectorAll('a[href]')).filter(el => el.offsetParent !== null).map(el => (el.textContent||'').trim()).slice(0,20)",
            )
            .await;
        let visible_errors = self
            .eval_diagnostic_array(
                "Array.from(document.querySelectorAll('[role=\"alert\"], .error, .alert-danger')).filter(el => el.offsetParent !== null).map(el => (el.textContent||'').trim()).slice(0,20)",
            )
            .await;

        json!({
            "title": title,
            "url": url,
            "visibleButtons": visible_buttons,
            "visibleLinks": visible_links,
            "visibleErrors": visible_errors,
        })
    }

    async fn eval_diagnostic(&self, expression: &str) -> Value {
        match eval::evaluate_and_serialize(self.session(), expression).await {
            Ok(envelope) => eval::process_result(&envelope),
            Err(e) => {
                tracing::debug!("diagnostic eval failed: {e}");
                Value::Null
            }
        }
    }

    async fn eval_diagnostic_array(&self, expression: &str) -> Value {
        match self.eval_diagnostic(expression).await {
            Value::Array(items) => Value::Array(items),
            _ => Value::Array(vec![]),
        }
    }

    async fn to_error_result(&self, action: &str, step: &Step, err: Error) -> StepResult {
        let diagnostics = self.capture_diagnostics().await;
        StepResult::error(action, err.message, Value::Object(step.0.clone())).with_diagnostics(diagnostics)
    }

    async fn dispatch(&self, action: &str, value: &Value) -> Result<StepResult> {
        match action {
            "goto" => self.do_goto(value).await,
            "wait" => self.do_wait(value).await,
            "click" => self.do_click(value).await,
            "hover" => self.do_hover(value).await,
            "fill" => self.do_fill(value).await,
            "fillForm" => self.do_fill_form(value).await,
            "press" => self.do_press(value).await,
            "type" => self.do_type(value).await,
            "select" | "selectOption" => self.do_select(value).await,
            "query" => self.do_query(value, false).await,
            "queryAll" => self.do_query(value, true).await,
            "snapshot" => self.do_snapshot().await,
            "viewport" => self.do_viewport(value).await,
            "cookies" => self.do_cookies(value).await,
            "console" => self.do_console().await,
            "network" => self.do_network().await,
            "assert" => self.do_assert(value).await,
            "scroll" => self.do_scroll(value).await,
            "drag" => self.do_drag(value).await,
            "eval" => self.do_eval(value).await,
            "pageFunction" => self.do_page_function(value).await,
            "poll" => self.do_poll(value).await,
            "pipeline" => self.do_pipeline(value).await,
            "writeSiteProfile" => self.do_write_site_profile(value).await,
            "screenshot" => self.do_screenshot(value).await,
            "refAt" => self.do_ref_at(value).await,
            "elementsAt" => self.do_elements_at(value).await,
            "elementsNear" => self.do_elements_near(value).await,
            "switchToFrame" => self.do_switch_to_frame(value).await,
            "switchToMainFrame" => self.do_switch_to_main_frame().await,
            "listFrames" => self.do_list_frames().await,
            "listTabs" => self.do_list_tabs().await,
            "openTab" => self.do_open_tab(value).await,
            "closeTab" => self.do_close_tab(value).await,
            "back" => self.do_history(-1).await,
            "forward" => self.do_history(1).await,
            "getBox" => self.do_get_box(value).await,
            "waitForNavigation" => self.do_wait_for_navigation(value).await,
            "extract" => self.do_extract(value).await,
            "inspect" => self.do_inspect().await,
            other => Err(Error::step_validation(format!("unrecognized action: {other}"))),
        }
    }

    // ---- helpers -------------------------------------------------------

    fn element_ref_from(&self, value: &Value) -> Result<ElementRef> {
        validate::parse_element_ref(value)
            .ok_or_else(|| Error::step_validation("requires a selector, ref, text, role+name, x+y, or selectors[]"))
    }

    fn action_timeout(&self, value: &Value) -> Duration {
        value
            .as_object()
            .and_then(|m| m.get("timeout"))
            .and_then(|v| v.as_i64())
            .map(clamp_timeout_ms)
            .unwrap_or(self.config.step_timeout)
    }

    fn click_options_from(&self, value: &Value) -> input::ClickOptions {
        let map = value.as_object();
        let button = match map.and_then(|m| m.get("button")).and_then(|v| v.as_str()) {
            Some("right") => input::MouseButton::Right,
            Some("middle") => input::MouseButton::Middle,
            _ => input::MouseButton::Left,
        };
        let click_count = map
            .and_then(|m| m.get("clickCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;
        let mut modifiers = input::Modifiers::default();
        if let Some(mods) = map.and_then(|m| m.get("modifiers")).and_then(|v| v.as_array()) {
            for m in mods {
                match m.as_str() {
                    Some("Control") => modifiers.control = true,
                    Some("Shift") => modifiers.shift = true,
                    Some("Alt") => modifiers.alt = true,
                    Some("Meta") => modifiers.meta = true,
                    _ => {}
                }
            }
        }
        input::ClickOptions {
            button,
            click_count,
            modifiers,
        }
    }

    async fn eval_string(&self, expression: &str) -> Result<String> {
        let envelope = eval::evaluate_and_serialize(self.session(), expression).await?;
        Ok(eval::process_result(&envelope).as_str().unwrap_or("").to_string())
    }

    async fn focus(&self, object_id: &str) -> Result<()> {
        let decl = "function(){ this.focus(); }";
        let _: Value = self
            .session()
            .send(
                "Runtime.callFunctionOn",
                json!({ "objectId": object_id, "functionDeclaration": decl, "returnByValue": true }),
            )
            .await?;
        Ok(())
    }

    async fn point_from(&self, value: &Value) -> Result<Point> {
        if let (Some(x), Some(y)) = (value.get("x").and_then(|v| v.as_f64()), value.get("y").and_then(|v| v.as_f64())) {
            return Ok(Point { x, y });
        }
        let element_ref = self.element_ref_from(value)?;
        let resolved = resolve::resolve(self.session(), &element_ref).await?;
        let point = actionability::get_clickable_point(self.session(), &resolved.object_id).await?;
        let _ = resolve::release(self.session(), &resolved.object_id).await;
        Ok(point)
    }

    fn match_string_spec(spec: &Value, actual: &str) -> bool {
        match spec {
            Value::String(expected) => actual == expected,
            Value::Object(map) => {
                if let Some(s) = map.get("equals").and_then(|v| v.as_str()) {
                    return actual == s;
                }
                if let Some(s) = map.get("contains").and_then(|v| v.as_str()) {
                    return actual.contains(s);
                }
                if let Some(s) = map.get("matches").and_then(|v| v.as_str()) {
                    return regex::Regex::new(s).map(|re| re.is_match(actual)).unwrap_or(false);
                }
                false
            }
            _ => false,
        }
    }

    // ---- navigation -----------------------------------------------------

    async fn do_goto(&self, value: &Value) -> Result<StepResult> {
        let url = match value {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("url")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::step_validation("goto requires url"))?
                .to_string(),
            _ => return Err(Error::step_validation("goto requires a url")),
        };

        let result: Value = self.session().send("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(Error::new(ErrorKind::Navigation, format!("navigation failed: {error_text}"))
                .with_operation(url));
        }

        crate::wait::wait_for_document_ready(self.session(), self.config.step_timeout).await?;

        let domain = site_profile::domain_from_url(&url);
        let mut step_result = StepResult::ok("goto", json!({ "url": url }));
        match site_profile::read_profile(&self.config.resolved_profile_dir(), &domain).await {
            Ok(Some(profile)) => step_result.site_profile = Some(profile),
            Ok(None) => {
                step_result.profile_available = Some(false);
                step_result.profile_domain = Some(domain);
            }
            Err(e) => {
                tracing::debug!("site profile read failed: {e}");
                step_result.profile_available = Some(false);
                step_result.profile_domain = Some(domain);
            }
        }
        Ok(step_result)
    }

    async fn do_wait(&self, value: &Value) -> Result<StepResult> {
        let timeout = self.action_timeout(value);
        match value {
            Value::String(selector) => {
                crate::wait::wait_for_selector(self.session(), selector, crate::wait::VisibilityIntent::Visible, timeout).await?;
                Ok(StepResult::ok("wait", json!({ "selector": selector })))
            }
            Value::Number(ms) => {
                let ms = ms.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(StepResult::ok("wait", json!({ "ms": ms })))
            }
            Value::Object(map) => {
                if let Some(selector) = map.get("selector").and_then(|v| v.as_str()) {
                    let intent = if map.get("hidden").and_then(|v| v.as_bool()).unwrap_or(false) {
                        crate::wait::VisibilityIntent::Hidden
                    } else {
                        crate::wait::VisibilityIntent::Visible
                    };
                    crate::wait::wait_for_selector(self.session(), selector, intent, timeout).await?;
                    return Ok(StepResult::ok("wait", json!({ "selector": selector })));
                }
                if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                    let exact = map.get("exact").and_then(|v| v.as_bool()).unwrap_or(false);
                    crate::wait::wait_for_text(self.session(), text, exact, timeout).await?;
                    return Ok(StepResult::ok("wait", json!({ "text": text })));
                }
                if let Some(expr) = map.get("fn").and_then(|v| v.as_str()) {
                    crate::wait::wait_for_function(self.session(), expr, timeout).await?;
                    return Ok(StepResult::ok("wait", json!({ "fn": expr })));
                }
                if map.get("networkIdle").is_some() {
                    let idle_time = Duration::from_millis(map.get("idleTime").and_then(|v| v.as_u64()).unwrap_or(500));
                    crate::wait::wait_for_network_idle(self.session(), idle_time, timeout).await?;
                    return Ok(StepResult::ok("wait", json!({ "networkIdle": true })));
                }
                if let Some(ms) = map.get("ms").and_then(|v| v.as_u64()) {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    return Ok(StepResult::ok("wait", json!({ "ms": ms })));
                }
                Err(Error::step_validation("wait: unrecognized wait shape"))
            }
            _ => Err(Error::step_validation("wait: unrecognized wait shape")),
        }
    }

    async fn do_wait_for_navigation(&self, value: &Value) -> Result<StepResult> {
        let timeout = self.action_timeout(value);
        let before_url = self.eval_string("document.location.href").await.unwrap_or_default();
        crate::wait::wait_for_document_ready(self.session(), timeout).await?;
        if let Some(expected) = value.as_object().and_then(|m| m.get("urlContains")).and_then(|v| v.as_str()) {
            let expected_json = serde_json::to_string(expected).unwrap_or_default();
            let expr = format!("(function(){{ return document.location.href.includes({expected_json}); }})()");
            crate::wait::wait_for_function(self.session(), &expr, timeout).await?;
        }
        let after_url = self.eval_string("document.location.href").await.unwrap_or_default();
        Ok(StepResult::ok("waitForNavigation", json!({ "from": before_url, "to": after_url })))
    }

    async fn do_history(&self, direction: i32) -> Result<StepResult> {
        let history: Value = self.session().send("Page.getNavigationHistory", json!({})).await?;
        let current = history.get("currentIndex").and_then(|v| v.as_i64()).unwrap_or(0);
        let entries = history.get("entries").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let target_index = current + direction as i64;
        if target_index < 0 || target_index as usize >= entries.len() {
            return Err(Error::new(ErrorKind::Navigation, "no history entry in that direction"));
        }
        let entry_id = entries[target_index as usize]
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::protocol("history entry missing id"))?;
        let _: Value = self
            .session()
            .send("Page.navigateToHistoryEntry", json!({ "entryId": entry_id }))
            .await?;
        crate::wait::wait_for_document_ready(self.session(), self.config.step_timeout).await?;
        Ok(StepResult::ok(if direction < 0 { "back" } else { "forward" }, Value::Null))
    }

    // ---- element interaction --------------------------------------------

    async fn do_click(&self, value: &Value) -> Result<StepResult> {
        let element_ref = self.element_ref_from(value)?;
        let timeout = self.action_timeout(value);
        let force = value.get("force").and_then(|v| v.as_bool()).unwrap_or(false);

        let resolved = actionability::wait_for_actionable(
            self.session(),
            &element_ref,
            ActionKind::Click,
            WaitOptions { timeout, force },
        )
        .await?;

        let point = actionability::get_clickable_point(self.session(), &resolved.object_id).await?;
        let options = self.click_options_from(value);

        self.install_click_sentinel(&resolved.object_id).await?;
        input::click(self.session(), point, options).await?;
        let observed = self.click_sentinel_fired(&resolved.object_id).await;

        let strategy = if observed {
            "native"
        } else {
            self.js_click_fallback(&resolved.object_id).await?;
            "jsClick-fallback"
        };

        let _ = resolve::release(self.session(), &resolved.object_id).await;
        Ok(StepResult::ok(
            "click",
            json!({
                "resolvedBy": resolved.resolved_by,
                "point": { "x": point.x, "y": point.y },
                "strategy": strategy,
            }),
        ))
    }

    async fn install_click_sentinel(&self, object_id: &str) -> Result<()> {
        let decl = "function(){ this.__browserstepClicked = false; this.addEventListener('click', () => { this.__browserstepClicked = true; }, { once: true, capture: true }); }";
        let _: Value = self
            .session()
            .send(
                "Runtime.callFunctionOn",
                json!({ "objectId": object_id, "functionDeclaration": decl, "returnByValue": true }),
            )
            .await?;
        Ok(())
    }

    async fn click_sentinel_fired(&self, object_id: &str) -> bool {
        let decl = "function(){ return !!this.__browserstepClicked; }";
        let result: Result<Value> = self
            .session()
            .send(
                "Runtime.callFunctionOn",
                json!({ "objectId": object_id, "functionDeclaration": decl, "returnByValue": true }),
            )
            .await;
        result
            .ok()
            .and_then(|v| v.get("result").and_then(|r| r.get("value")).and_then(|v| v.as_bool()))
            .unwrap_or(false)
    }

    async fn js_click_fallback(&self, object_id: &str) -> Result<()> {
        let decl = "function(){ this.click(); }";
        let _: Value = self
            .session()
            .send(
                "Runtime.callFunctionOn",
                json!({ "objectId": object_id, "functionDeclaration": decl, "returnByValue": true }),
            )
            .await?;
        Ok(())
    }

    async fn do_hover(&self, value: &Value) -> Result<StepResult> {
        let element_ref = self.element_ref_from(value)?;
        let timeout = self.action_timeout(value);
        let resolved = actionability::wait_for_actionable(
            self.session(),
            &element_ref,
            ActionKind::Hover,
            WaitOptions { timeout, force: false },
        )
        .await?;
        let point = actionability::get_clickable_point(self.session(), &resolved.object_id).await?;
        input::hover(self.session(), point).await?;
        let _ = resolve::release(self.session(), &resolved.object_id).await;
        Ok(StepResult::ok("hover", json!({ "resolvedBy": resolved.resolved_by })))
    }

    async fn do_fill(&self, value: &Value) -> Result<StepResult> {
        let target = self.element_ref_from(value)?;
        let text = value
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::step_validation("fill requires value"))?;
        let timeout = self.action_timeout(value);

        let resolved = actionability::wait_for_actionable(
            self.session(),
            &target,
            ActionKind::Fill,
            WaitOptions { timeout, force: false },
        )
        .await?;
        self.focus(&resolved.object_id).await?;
        input::insert_text(self.session(), text).await?;
        let _ = resolve::release(self.session(), &resolved.object_id).await;
        Ok(StepResult::ok("fill", json!({ "resolvedBy": resolved.resolved_by })))
    }

    async fn do_fill_form(&self, value: &Value) -> Result<StepResult> {
        let fields = value
            .as_object()
            .and_then(|m| m.get("fields"))
            .and_then(|v| v.as_array())
            .or_else(|| value.as_array())
            .ok_or_else(|| Error::step_validation("fillForm requires a fields array"))?;

        let mut filled = Vec::new();
        for field in fields {
            let result = self.do_fill(field).await?;
            filled.push(result.output.unwrap_or(Value::Null));
        }
        Ok(StepResult::ok("fillForm", json!({ "filled": filled })))
    }

    async fn do_type(&self, value: &Value) -> Result<StepResult> {
        let target = self.element_ref_from(value)?;
        let text = value
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::step_validation("type requires text"))?;
        let timeout = self.action_timeout(value);
        let resolved = actionability::wait_for_actionable(
            self.session(),
            &target,
            ActionKind::Type,
            WaitOptions { timeout, force: false },
        )
        .await?;
        self.focus(&resolved.object_id).await?;
        input::type_text(self.session(), text).await?;
        let _ = resolve::release(self.session(), &resolved.object_id).await;
        Ok(StepResult::ok("type", json!({ "resolvedBy": resolved.resolved_by })))
    }

    async fn do_press(&self, value: &Value) -> Result<StepResult> {
        let combo = value
            .as_str()
            .ok_or_else(|| Error::step_validation("press requires a string combo"))?;
        input::press(self.session(), combo).await?;
        Ok(StepResult::ok("press", json!({ "combo": combo })))
    }

    async fn do_select(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().ok_or_else(|| Error::step_validation("select requires an object"))?;
        let target = self.element_ref_from(value)?;
        let timeout = self.action_timeout(value);
        let resolved = actionability::wait_for_actionable(
            self.session(),
            &target,
            ActionKind::Select,
            WaitOptions { timeout, force: false },
        )
        .await?;

        let values: Vec<String> = if let Some(v) = map.get("value").and_then(|v| v.as_str()) {
            vec![v.to_string()]
        } else if let Some(arr) = map.get("values").and_then(|v| v.as_array()) {
            arr.iter().filter_map(|v| v.as_str().map(String::from)).collect()
        } else {
            let _ = resolve::release(self.session(), &resolved.object_id).await;
            return Err(Error::step_validation("select requires value or values"));
        };

        let values_json = serde_json::to_string(&values).unwrap_or_default();
        let decl = format!(
            "function(){{ var wanted = {values_json}; for (var i=0;i<this.options.length;i++) {{ this.options[i].selected = wanted.indexOf(this.options[i].value) !== -1; }} this.dispatchEvent(new Event('change', {{bubbles:true}})); }}"
        );
        let _: Value = self
            .session()
            .send(
                "Runtime.callFunctionOn",
                json!({ "objectId": resolved.object_id, "functionDeclaration": decl, "returnByValue": true }),
            )
            .await?;
        let _ = resolve::release(self.session(), &resolved.object_id).await;
        Ok(StepResult::ok("select", json!({ "values": values })))
    }

    async fn do_query(&self, value: &Value, all: bool) -> Result<StepResult> {
        let element_ref = self.element_ref_from(value)?;
        let selector = match &element_ref {
            ElementRef::Selector(s) => s.clone(),
            _ => return Err(Error::step_validation("query/queryAll require a selector target")),
        };
        let sel_json = serde_json::to_string(&selector).unwrap_or_default();
        let expr = if all {
            format!("Array.from(document.querySelectorAll({sel_json}))")
        } else {
            format!("document.querySelector({sel_json})")
        };
        let envelope = eval::evaluate_and_serialize(self.session(), &expr).await?;
        Ok(StepResult::ok(if all { "queryAll" } else { "query" }, eval::process_result(&envelope)))
    }

    async fn do_ref_at(&self, value: &Value) -> Result<StepResult> {
        let element_ref = self.element_ref_from(value)?;
        let resolved = resolve::resolve(self.session(), &element_ref).await?;
        let output = json!({ "box": resolved.bounding_box, "resolvedBy": resolved.resolved_by });
        let _ = resolve::release(self.session(), &resolved.object_id).await;
        Ok(StepResult::ok("refAt", output))
    }

    async fn do_get_box(&self, value: &Value) -> Result<StepResult> {
        let element_ref = self.element_ref_from(value)?;
        let resolved = resolve::resolve(self.session(), &element_ref).await?;
        let output = serde_json::to_value(resolved.bounding_box).unwrap_or(Value::Null);
        let _ = resolve::release(self.session(), &resolved.object_id).await;
        Ok(StepResult::ok("getBox", output))
    }

    async fn do_elements_at(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().ok_or_else(|| Error::step_validation("elementsAt requires x and y"))?;
        let x = map
            .get("x")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::step_validation("elementsAt requires x"))?;
        let y = map
            .get("y")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::step_validation("elementsAt requires y"))?;
        let expr = format!("document.elementsFromPoint({x}, {y})");
        let envelope = eval::evaluate_and_serialize(self.session(), &expr).await?;
        Ok(StepResult::ok("elementsAt", eval::process_result(&envelope)))
    }

    async fn do_elements_near(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().ok_or_else(|| Error::step_validation("elementsNear requires x and y"))?;
        let x = map
            .get("x")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::step_validation("elementsNear requires x"))?;
        let y = map
            .get("y")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::step_validation("elementsNear requires y"))?;
        let radius = map.get("radius").and_then(|v| v.as_f64()).unwrap_or(20.0);
        let expr = format!(
            "(function(){{ var pts=[]; for (var dx=-1; dx<=1; dx++) for (var dy=-1; dy<=1; dy++) pts.push(document.elementFromPoint({x}+dx*{radius}, {y}+dy*{radius})); return pts.filter(Boolean); }})()"
        );
        let envelope = eval::evaluate_and_serialize(self.session(), &expr).await?;
        Ok(StepResult::ok("elementsNear", eval::process_result(&envelope)))
    }

    async fn do_snapshot(&self) -> Result<StepResult> {
        let _: Value = self
            .session()
            .send(
                "Runtime.evaluate",
                json!({ "expression": crate::scripts::snapshot_helpers(), "returnByValue": true }),
            )
            .await?;
        let result: Value = self
            .session()
            .send(
                "Runtime.evaluate",
                json!({ "expression": "window.__browserstepSnapshot.capture()", "returnByValue": true }),
            )
            .await?;
        let value = result.get("result").and_then(|r| r.get("value")).cloned().unwrap_or(Value::Null);
        Ok(StepResult::ok("snapshot", value))
    }

    // ---- viewport / cookies / capture read-back -------------------------

    async fn do_viewport(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().ok_or_else(|| Error::step_validation("viewport requires width/height"))?;
        let width = map.get("width").and_then(|v| v.as_f64()).unwrap_or(1280.0);
        let height = map.get("height").and_then(|v| v.as_f64()).unwrap_or(720.0);
        let mobile = map.get("mobile").and_then(|v| v.as_bool()).unwrap_or(false);
        let scale = map.get("deviceScaleFactor").and_then(|v| v.as_f64()).unwrap_or(1.0);
        let _: Value = self
            .session()
            .send(
                "Emulation.setDeviceMetricsOverride",
                json!({ "width": width as i64, "height": height as i64, "deviceScaleFactor": scale, "mobile": mobile }),
            )
            .await?;
        Ok(StepResult::ok("viewport", json!({ "width": width, "height": height })))
    }

    async fn do_cookies(&self, value: &Value) -> Result<StepResult> {
        if let Some(map) = value.as_object() {
            if let Some(name) = map.get("name").and_then(|v| v.as_str()) {
                let val = map.get("value").and_then(|v| v.as_str()).unwrap_or("");
                let mut params = json!({ "name": name, "value": val });
                if let Some(url) = map.get("url").and_then(|v| v.as_str()) {
                    params["url"] = json!(url);
                }
                if let Some(domain) = map.get("domain").and_then(|v| v.as_str()) {
                    params["domain"] = json!(domain);
                }
                let _: Value = self.session().send("Network.setCookie", params).await?;
                return Ok(StepResult::ok("cookies", json!({ "set": true })));
            }
        }
        let result: Value = self.session().send("Network.getCookies", json!({})).await?;
        Ok(StepResult::ok("cookies", result.get("cookies").cloned().unwrap_or(json!([]))))
    }

    async fn do_console(&self) -> Result<StepResult> {
        let messages = self.console.messages().await;
        Ok(StepResult::ok("console", serde_json::to_value(messages).unwrap_or(json!([]))))
    }

    async fn do_network(&self) -> Result<StepResult> {
        let errors = self.network.errors().await;
        Ok(StepResult::ok("network", serde_json::to_value(errors).unwrap_or(json!([]))))
    }

    // ---- assertions ------------------------------------------------------

    async fn do_assert(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().ok_or_else(|| Error::step_validation("assert requires an object"))?;
        let mut assertions = Vec::new();
        let mut failures = Vec::new();

        if let Some(url_spec) = map.get("url") {
            let current = self.eval_string("document.location.href").await?;
            let passed = Self::match_string_spec(url_spec, &current);
            assertions.push(json!({ "type": "url", "passed": passed }));
            if !passed {
                failures.push("url");
            }
        }
        if let Some(title_spec) = map.get("title") {
            let current = self.eval_string("document.title").await?;
            let passed = Self::match_string_spec(title_spec, &current);
            assertions.push(json!({ "type": "title", "passed": passed }));
            if !passed {
                failures.push("title");
            }
        }
        if let Some(text_spec) = map.get("text") {
            let current = self.eval_string("document.body.innerText").await?;
            let passed = Self::match_string_spec(text_spec, &current);
            assertions.push(json!({ "type": "text", "passed": passed }));
            if !passed {
                failures.push("text");
            }
        }
        if let Some(visible_spec) = map.get("visible") {
            let element_ref = validate::parse_element_ref(visible_spec)
                .ok_or_else(|| Error::step_validation("assert.visible requires a target"))?;
            let passed = resolve::resolve(self.session(), &element_ref).await.is_ok();
            if let Ok(resolved) = resolve::resolve(self.session(), &element_ref).await {
                let _ = resolve::release(self.session(), &resolved.object_id).await;
            }
            assertions.push(json!({ "type": "visible", "passed": passed }));
            if !passed {
                failures.push("visible");
            }
        }

        if failures.is_empty() {
            Ok(StepResult::ok("assert", json!({ "assertions": assertions })))
        } else {
            Ok(StepResult::error(
                "assert",
                format!("assertion(s) failed: {}", failures.join(", ")),
                json!({ "assertions": assertions }),
            ))
        }
    }

    // ---- scroll / drag -----------------------------------------------------

    async fn do_scroll(&self, value: &Value) -> Result<StepResult> {
        if let Some(element_ref) = validate::parse_element_ref(value) {
            let resolved = actionability::scroll_until_visible(
                self.session(),
                &element_ref,
                ScrollOptions { max_scrolls: 20, timeout: self.action_timeout(value) },
            )
            .await?;
            let _ = resolve::release(self.session(), &resolved.object_id).await;
            return Ok(StepResult::ok("scroll", json!({ "scrolledIntoView": true })));
        }
        let map = value
            .as_object()
            .ok_or_else(|| Error::step_validation("scroll requires deltaX/deltaY or a target"))?;
        let delta_x = map.get("deltaX").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let delta_y = map.get("deltaY").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let point = Point {
            x: map.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0),
            y: map.get("y").and_then(|v| v.as_f64()).unwrap_or(0.0),
        };
        input::scroll(self.session(), point, delta_x, delta_y).await?;
        Ok(StepResult::ok("scroll", json!({ "deltaX": delta_x, "deltaY": delta_y })))
    }

    async fn do_drag(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().ok_or_else(|| Error::step_validation("drag requires from and to"))?;
        let from_point = self
            .point_from(map.get("from").ok_or_else(|| Error::step_validation("drag requires from"))?)
            .await?;
        let to_point = self
            .point_from(map.get("to").ok_or_else(|| Error::step_validation("drag requires to"))?)
            .await?;
        input::drag(self.session(), from_point, to_point, 10).await?;
        Ok(StepResult::ok(
            "drag",
            json!({ "from": {"x": from_point.x, "y": from_point.y}, "to": {"x": to_point.x, "y": to_point.y} }),
        ))
    }

    // ---- dynamic (eval/pageFunction/poll/pipeline/extract) ---------------

    async fn do_eval(&self, value: &Value) -> Result<StepResult> {
        let expr = value.as_str().ok_or_else(|| Error::step_validation("eval requires a string"))?;
        let context = *self.frame_context.lock().await;
        let envelope = eval::evaluate_and_serialize_in_context(self.session(), expr, context).await?;
        Ok(StepResult::ok("eval", eval::process_result(&envelope)))
    }

    async fn do_extract(&self, value: &Value) -> Result<StepResult> {
        let expr = value.as_str().ok_or_else(|| Error::step_validation("extract requires a string"))?;
        let context = *self.frame_context.lock().await;
        let envelope = eval::evaluate_and_serialize_in_context(self.session(), expr, context).await?;
        Ok(StepResult::ok("extract", json!({ "value": eval::process_result(&envelope) })))
    }

    async fn do_page_function(&self, value: &Value) -> Result<StepResult> {
        let (src, pass_ref) = match value {
            Value::String(s) => (s.clone(), false),
            Value::Object(map) => (
                map.get("fn")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::step_validation("pageFunction requires fn"))?
                    .to_string(),
                map.get("passRefTable").and_then(|v| v.as_bool()).unwrap_or(false),
            ),
            _ => return Err(Error::step_validation("pageFunction requires a string or object")),
        };
        let value = dynamic::run_page_function(self.session(), &src, pass_ref, self.config.step_timeout).await?;
        Ok(StepResult::ok("pageFunction", value))
    }

    async fn do_poll(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().ok_or_else(|| Error::step_validation("poll requires an object"))?;
        let expr = map.get("fn").and_then(|v| v.as_str()).ok_or_else(|| Error::step_validation("poll requires fn"))?;
        let interval = Duration::from_millis(map.get("interval").and_then(|v| v.as_u64()).unwrap_or(100));
        let timeout = map
            .get("timeout")
            .and_then(|v| v.as_i64())
            .map(clamp_timeout_ms)
            .unwrap_or(self.config.step_timeout);
        let outcome = dynamic::run_poll(self.session(), expr, interval, timeout).await?;
        Ok(StepResult::ok(
            "poll",
            json!({ "resolved": outcome.resolved, "evaluations": outcome.evaluations, "value": outcome.value }),
        ))
    }

    async fn do_pipeline(&self, value: &Value) -> Result<StepResult> {
        let ops = value.as_array().ok_or_else(|| Error::step_validation("pipeline requires an array"))?;
        let result = dynamic::run_pipeline(self.session(), ops, self.config.step_timeout).await?;
        Ok(StepResult::ok("pipeline", result))
    }

    async fn do_write_site_profile(&self, value: &Value) -> Result<StepResult> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::step_validation("writeSiteProfile requires an object"))?;
        let content = map
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::step_validation("writeSiteProfile requires content"))?;
        let domain = match map.get("domain").and_then(|v| v.as_str()) {
            Some(d) => d.to_string(),
            None => {
                let current = self.eval_string("document.location.href").await?;
                site_profile::domain_from_url(&current)
            }
        };
        let path = site_profile::write_profile(&self.config.resolved_profile_dir(), &domain, content).await?;
        Ok(StepResult::ok("writeSiteProfile", json!({ "domain": domain, "path": path.display().to_string() })))
    }

    // ---- screenshot --------------------------------------------------------

    async fn do_screenshot(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().cloned().unwrap_or_default();
        let format = match map.get("format").and_then(|v| v.as_str()) {
            Some("jpeg") => Format::Jpeg,
            Some("webp") => Format::Webp,
            _ => Format::Png,
        };
        let quality = map.get("quality").and_then(|v| v.as_u64()).map(|q| q as u8);

        let mode = if map.get("fullPage").and_then(|v| v.as_bool()).unwrap_or(false) {
            Mode::FullPage
        } else if let Some(region) = map.get("region").and_then(|v| v.as_object()) {
            Mode::Region(Rect {
                x: region.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0),
                y: region.get("y").and_then(|v| v.as_f64()).unwrap_or(0.0),
                width: region.get("width").and_then(|v| v.as_f64()).unwrap_or(0.0),
                height: region.get("height").and_then(|v| v.as_f64()).unwrap_or(0.0),
            })
        } else if map.contains_key("selector") || map.contains_key("ref") {
            let element_ref = validate::parse_element_ref(&Value::Object(map.clone()))
                .ok_or_else(|| Error::step_validation("screenshot element mode requires a target"))?;
            let resolved = resolve::resolve(self.session(), &element_ref).await?;
            let padding = map.get("padding").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
            let bounding_box = resolved.bounding_box;
            let _ = resolve::release(self.session(), &resolved.object_id).await;
            Mode::Element { bounding_box, padding }
        } else {
            Mode::Viewport
        };

        let bytes = screenshot::capture(self.session(), ScreenshotOptions { format, quality, mode }).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let format_name = match format {
            Format::Png => "png",
            Format::Jpeg => "jpeg",
            Format::Webp => "webp",
        };
        Ok(StepResult::ok("screenshot", json!({ "data": encoded, "format": format_name })))
    }

    // ---- frames / tabs -----------------------------------------------------

    async fn do_switch_to_frame(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object().ok_or_else(|| Error::step_validation("switchToFrame requires an object"))?;

        let frame_id = if let Some(fid) = map.get("frameId").and_then(|v| v.as_str()) {
            fid.to_string()
        } else {
            let element_ref = self.element_ref_from(value)?;
            let resolved = resolve::resolve(self.session(), &element_ref).await?;
            let described: Value = self
                .session()
                .send("DOM.describeNode", json!({ "objectId": resolved.object_id }))
                .await?;
            let _ = resolve::release(self.session(), &resolved.object_id).await;
            described
                .get("node")
                .and_then(|n| n.get("frameId"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::protocol("could not resolve frameId for iframe"))?
                .to_string()
        };

        let world: Value = self
            .session()
            .send("Page.createIsolatedWorld", json!({ "frameId": frame_id, "worldName": "browserstep" }))
            .await?;
        let context_id = world
            .get("executionContextId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::protocol("Page.createIsolatedWorld missing executionContextId"))?;

        *self.frame_context.lock().await = Some(context_id);
        Ok(StepResult::ok("switchToFrame", json!({ "frameId": frame_id, "contextId": context_id })))
    }

    async fn do_switch_to_main_frame(&self) -> Result<StepResult> {
        *self.frame_context.lock().await = None;
        Ok(StepResult::ok("switchToMainFrame", Value::Null))
    }

    async fn do_list_frames(&self) -> Result<StepResult> {
        let tree: Value = self.session().send("Page.getFrameTree", json!({})).await?;
        Ok(StepResult::ok("listFrames", tree.get("frameTree").cloned().unwrap_or(Value::Null)))
    }

    async fn do_list_tabs(&self) -> Result<StepResult> {
        let targets = self.target_registry.list().await;
        Ok(StepResult::ok("listTabs", serde_json::to_value(targets).unwrap_or(json!([]))))
    }

    async fn do_open_tab(&self, value: &Value) -> Result<StepResult> {
        let map = value.as_object();
        let url = map.and_then(|m| m.get("url")).and_then(|v| v.as_str()).unwrap_or("about:blank").to_string();
        let options = NewTargetOptions {
            url,
            width: map.and_then(|m| m.get("width")).and_then(|v| v.as_u64()).map(|w| w as u32),
            height: map.and_then(|m| m.get("height")).and_then(|v| v.as_u64()).map(|h| h as u32),
            background: map.and_then(|m| m.get("background")).and_then(|v| v.as_bool()).unwrap_or(false),
            new_window: map.and_then(|m| m.get("newWindow")).and_then(|v| v.as_bool()).unwrap_or(false),
        };
        let target_id = self.target_registry.create(options).await?;
        let session_id = self.session_registry.attach(&target_id).await?;
        Ok(StepResult::ok("openTab", json!({ "targetId": target_id, "sessionId": session_id })))
    }

    async fn do_close_tab(&self, value: &Value) -> Result<StepResult> {
        let target_id = value
            .as_object()
            .and_then(|m| m.get("targetId"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::step_validation("closeTab requires targetId"))?;
        self.session_registry.detach_by_target(target_id).await?;
        self.target_registry.close(target_id).await?;
        Ok(StepResult::ok("closeTab", json!({ "targetId": target_id })))
    }

    async fn do_inspect(&self) -> Result<StepResult> {
        let diagnostics = self.capture_diagnostics().await;
        Ok(StepResult::ok("inspect", diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    async fn make_executor() -> (StepExecutor, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    let id = frame.get("id").cloned().unwrap_or(Value::Null);
                    let reply = json!({ "id": id, "result": {} });
                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let transport = Arc::new(Transport::connect(&format!("ws://{addr}")).await.unwrap());
        let page = Arc::new(PageSession::new(transport.clone(), "s1".into(), "t1".into()));
        let target_registry = Arc::new(TargetRegistry::new(transport.clone()));
        let session_registry = Arc::new(SessionRegistry::new(transport));
        let console = Arc::new(ConsoleCapture::new(100));
        let network = Arc::new(NetworkCapture::new(vec![]));
        let config = RunConfig::default();

        (
            StepExecutor::new(page, target_registry, session_registry, config, console, network),
            server,
        )
    }

    fn step(value: Value) -> Step {
        Step(value.as_object().unwrap().clone())
    }

    #[tokio::test]
    async fn invalid_step_list_raises_before_any_side_effect() {
        let (executor, _server) = make_executor().await;
        let steps = vec![step(json!({ "goto": "https://ex.test/" })), step(json!({ "click": "" }))];
        let err = executor.run(&steps, true).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepValidation);
    }

    #[tokio::test]
    async fn match_string_spec_supports_contains() {
        assert!(StepExecutor::match_string_spec(&json!({ "contains": "/wiki/Albert" }), "https://ex.test/wiki/Albert_Einstein"));
        assert!(!StepExecutor::match_string_spec(&json!({ "contains": "/missing" }), "https://ex.test/wiki/Albert_Einstein"));
    }

    #[tokio::test]
    async fn ok_step_result_never_carries_error() {
        let result = StepResult::ok("press", json!({}));
        assert_eq!(result.status, StepStatus::Ok);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn error_step_result_always_echoes_params() {
        let (executor, _server) = make_executor().await;
        let s = step(json!({ "click": "" }));
        let result = executor.to_error_result("click", &s, Error::element_not_found("#missing")).await;
        assert_eq!(result.status, StepStatus::Error);
        assert!(result.error.is_some());
        assert!(result.params.is_some());
    }
}
