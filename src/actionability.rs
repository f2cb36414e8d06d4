//! C8 — actionability checker. Waits for a resolved element to satisfy the
//! required states for a given action before handing it to the input emulator.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::page_session::PageSession;
use crate::resolve::{self, ElementRef, ResolvedElement};
use crate::scripts;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredState {
    Attached,
    Visible,
    Enabled,
    Editable,
    Stable,
    HitTarget,
    PointerEvents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Click,
    Hover,
    Fill,
    Type,
    Select,
    Default,
}

/// Fixed required-states table per action kind (spec §4.8).
pub fn required_states(action: ActionKind) -> &'static [RequiredState] {
    match action {
        ActionKind::Click | ActionKind::Hover => &[RequiredState::Attached],
        ActionKind::Fill | ActionKind::Type => &[RequiredState::Attached, RequiredState::Editable],
        ActionKind::Select => &[RequiredState::Attached],
        ActionKind::Default => &[RequiredState::Attached],
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub matches: bool,
    pub received: String,
}

async fn ensure_helpers(session: &PageSession) -> Result<()> {
    let _: Value = session
        .send(
            "Runtime.evaluate",
            json!({ "expression": scripts::actionability_helpers(), "returnByValue": true }),
        )
        .await?;
    Ok(())
}

async fn run_probe(session: &PageSession, object_id: &str, probe_name: &str) -> Result<ProbeResult> {
    ensure_helpers(session).await?;
    let function_declaration = format!(
        "function(){{ return window.__browserstepActionability.{probe_name}(this); }}"
    );
    let result: Value = session
        .send(
            "Runtime.callFunctionOn",
            json!({
                "objectId": object_id,
                "functionDeclaration": function_declaration,
                "returnByValue": true,
                "awaitPromise": true,
            }),
        )
        .await?;
    let value = result
        .get("result")
        .and_then(|r| r.get("value"))
        .cloned()
        .ok_or_else(|| Error::protocol(format!("{probe_name} probe returned no value")))?;
    Ok(ProbeResult {
        matches: value.get("matches").and_then(|v| v.as_bool()).unwrap_or(false),
        received: value
            .get("received")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
    })
}

async fn probe_for(session: &PageSession, object_id: &str, state: RequiredState) -> Result<ProbeResult> {
    let name = match state {
        RequiredState::Attached => "attached",
        RequiredState::Visible => "visible",
        RequiredState::Enabled => "enabled",
        RequiredState::Editable => "editable",
        RequiredState::Stable => "stable",
        RequiredState::HitTarget => "hitTarget",
        RequiredState::PointerEvents => "pointerEvents",
    };
    run_probe(session, object_id, name).await
}

pub struct WaitOptions {
    pub timeout: Duration,
    pub force: bool,
}

/// Resolves `element_ref`, then repeatedly probes every required state for
/// `action` until all match or the deadline passes. Releases the handle on
/// every retry and failure path; the caller releases it on success.
pub async fn wait_for_actionable(
    session: &PageSession,
    element_ref: &ElementRef,
    action: ActionKind,
    options: WaitOptions,
) -> Result<ResolvedElement> {
    let start = Instant::now();
    let states = required_states(action);
    // Point-targeting actions additionally require the hit-target probe to
    // succeed (spec §4.8), independent of the fixed required-states table.
    let targets_point = matches!(action, ActionKind::Click | ActionKind::Hover);

    loop {
        let resolved = resolve::resolve(session, element_ref).await?;

        if options.force {
            return Ok(resolved);
        }

        let mut all_matched = true;
        for state in states {
            let probe = probe_for(session, &resolved.object_id, *state).await?;
            if !probe.matches {
                all_matched = false;
                break;
            }
        }
        if all_matched && targets_point {
            let probe = probe_for(session, &resolved.object_id, RequiredState::HitTarget).await?;
            all_matched = probe.matches;
        }

        if all_matched {
            return Ok(resolved);
        }

        let _ = resolve::release(session, &resolved.object_id).await;

        if start.elapsed() >= options.timeout {
            return Err(Error::element_not_found(format!(
                "{:?} did not become actionable for {:?} within {:?}",
                element_ref, action, options.timeout
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

pub async fn get_clickable_point(session: &PageSession, object_id: &str) -> Result<Point> {
    ensure_helpers(session).await?;
    let result: Value = session
        .send(
            "Runtime.callFunctionOn",
            json!({
                "objectId": object_id,
                "functionDeclaration": "function(){ return window.__browserstepActionability.clickablePoint(this); }",
                "returnByValue": true,
            }),
        )
        .await?;
    let value = result
        .get("result")
        .and_then(|r| r.get("value"))
        .ok_or_else(|| Error::protocol("clickablePoint probe returned no value"))?;
    Ok(Point {
        x: value.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0),
        y: value.get("y").and_then(|v| v.as_f64()).unwrap_or(0.0),
    })
}

pub struct ScrollOptions {
    pub max_scrolls: u32,
    pub timeout: Duration,
}

/// Bounded loop: re-resolve, scroll the element into view if found-but-hidden,
/// otherwise scroll the viewport by a page height and retry.
pub async fn scroll_until_visible(
    session: &PageSession,
    element_ref: &ElementRef,
    options: ScrollOptions,
) -> Result<ResolvedElement> {
    let start = Instant::now();
    let mut scrolls = 0u32;

    loop {
        match resolve::resolve(session, element_ref).await {
            Ok(resolved) => {
                let probe = probe_for(session, &resolved.object_id, RequiredState::Visible).await?;
                if probe.matches {
                    return Ok(resolved);
                }
                let _: Value = session
                    .send(
                        "Runtime.callFunctionOn",
                        json!({
                            "objectId": resolved.object_id,
                            "functionDeclaration": "function(){ this.scrollIntoView({block:'center', inline:'nearest'}); }",
                            "returnByValue": true,
                        }),
                    )
                    .await?;
                let _ = resolve::release(session, &resolved.object_id).await;
            }
            Err(_) => {
                let _: Value = session
                    .send(
                        "Runtime.evaluate",
                        json!({ "expression": "window.scrollBy(0, window.innerHeight)", "returnByValue": true }),
                    )
                    .await?;
            }
        }

        scrolls += 1;
        if scrolls >= options.max_scrolls || start.elapsed() >= options.timeout {
            return Err(Error::element_not_found(format!(
                "{:?} not visible after {} scrolls",
                element_ref, scrolls
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_states_match_fixed_table() {
        assert_eq!(required_states(ActionKind::Click), &[RequiredState::Attached]);
        assert_eq!(
            required_states(ActionKind::Fill),
            &[RequiredState::Attached, RequiredState::Editable]
        );
        assert_eq!(required_states(ActionKind::Select), &[RequiredState::Attached]);
        assert_eq!(required_states(ActionKind::Default), &[RequiredState::Attached]);
    }
}
