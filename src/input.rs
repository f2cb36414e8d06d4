//! C9 — input emulator. Translates high-level requests into remote
//! `Input.dispatch*` commands.

use serde_json::{json, Value};

use crate::actionability::Point;
use crate::error::Result;
use crate::page_session::PageSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    fn as_cdp(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Middle => "middle",
            Self::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Modifiers {
    pub alt: bool,
    pub control: bool,
    pub meta: bool,
    pub shift: bool,
}

impl Modifiers {
    fn bitmask(self) -> u32 {
        (self.alt as u32) | ((self.control as u32) << 1) | ((self.meta as u32) << 2) | ((self.shift as u32) << 3)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClickOptions {
    pub button: MouseButton,
    pub click_count: u32,
    pub modifiers: Modifiers,
}

impl Default for ClickOptions {
    fn default() -> Self {
        Self {
            button: MouseButton::Left,
            click_count: 1,
            modifiers: Modifiers::default(),
        }
    }
}

pub async fn click(session: &PageSession, point: Point, options: ClickOptions) -> Result<()> {
    mouse_down(session, point, options.button, options.click_count, options.modifiers).await?;
    mouse_up(session, point, options.button, options.click_count, options.modifiers).await?;
    Ok(())
}

pub async fn hover(session: &PageSession, point: Point) -> Result<()> {
    session
        .send::<Value>(
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseMoved", "x": point.x, "y": point.y }),
        )
        .await?;
    Ok(())
}

pub async fn mouse_down(
    session: &PageSession,
    point: Point,
    button: MouseButton,
    click_count: u32,
    modifiers: Modifiers,
) -> Result<()> {
    session
        .send::<Value>(
            "Input.dispatchMouseEvent",
            json!({
                "type": "mousePressed",
                "x": point.x,
                "y": point.y,
                "button": button.as_cdp(),
                "clickCount": click_count,
                "modifiers": modifiers.bitmask(),
            }),
        )
        .await?;
    Ok(())
}

pub async fn mouse_move(session: &PageSession, point: Point) -> Result<()> {
    session
        .send::<Value>(
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseMoved", "x": point.x, "y": point.y }),
        )
        .await?;
    Ok(())
}

pub async fn mouse_up(
    session: &PageSession,
    point: Point,
    button: MouseButton,
    click_count: u32,
    modifiers: Modifiers,
) -> Result<()> {
    session
        .send::<Value>(
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseReleased",
                "x": point.x,
                "y": point.y,
                "button": button.as_cdp(),
                "clickCount": click_count,
                "modifiers": modifiers.bitmask(),
            }),
        )
        .await?;
    Ok(())
}

/// Mouse-down then mouse-move-through-waypoints then mouse-up, composed from
/// the primitives above.
pub async fn drag(session: &PageSession, from: Point, to: Point, steps: u32) -> Result<()> {
    mouse_down(session, from, MouseButton::Left, 1, Modifiers::default()).await?;
    let steps = steps.max(1);
    for i in 1..=steps {
        let t = i as f64 / steps as f64;
        let intermediate = Point {
            x: from.x + (to.x - from.x) * t,
            y: from.y + (to.y - from.y) * t,
        };
        mouse_move(session, intermediate).await?;
    }
    mouse_up(session, to, MouseButton::Left, 1, Modifiers::default()).await?;
    Ok(())
}

async fn dispatch_key(session: &PageSession, event_type: &str, key: &str, modifiers: Modifiers) -> Result<()> {
    session
        .send::<Value>(
            "Input.dispatchKeyEvent",
            json!({
                "type": event_type,
                "key": key,
                "modifiers": modifiers.bitmask(),
            }),
        )
        .await?;
    Ok(())
}

/// For each code point: key-down, key-press (char event), key-up, plus an
/// `insertText` for non-printable safety.
pub async fn type_text(session: &PageSession, text: &str) -> Result<()> {
    for ch in text.chars() {
        let key = ch.to_string();
        dispatch_key(session, "keyDown", &key, Modifiers::default()).await?;
        session
            .send::<Value>(
                "Input.dispatchKeyEvent",
                json!({ "type": "char", "text": key, "unmodifiedText": key }),
            )
            .await?;
        dispatch_key(session, "keyUp", &key, Modifiers::default()).await?;
    }
    insert_text(session, "").await?;
    Ok(())
}

/// A single synthetic insertText; preferred for form fills since it preserves
/// IME and framework listeners instead of simulating individual keystrokes.
pub async fn insert_text(session: &PageSession, text: &str) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    session
        .send::<Value>("Input.insertText", json!({ "text": text }))
        .await?;
    Ok(())
}

fn key_for(name: &str) -> &str {
    match name {
        "Control" | "Shift" | "Alt" | "Meta" => name,
        other => other,
    }
}

/// Parses `Modifier+...+Key` and issues down-modifiers, down+up key,
/// up-modifiers (reverse order).
pub async fn press(session: &PageSession, combo: &str) -> Result<()> {
    let parts: Vec<&str> = combo.split('+').collect();
    let (modifier_names, key) = parts.split_at(parts.len().saturating_sub(1));
    let key = key.first().copied().unwrap_or(combo);

    let mut modifiers = Modifiers::default();
    for name in modifier_names {
        match *name {
            "Control" => modifiers.control = true,
            "Shift" => modifiers.shift = true,
            "Alt" => modifiers.alt = true,
            "Meta" => modifiers.meta = true,
            _ => {}
        }
    }

    for name in modifier_names {
        dispatch_key(session, "keyDown", key_for(name), modifiers).await?;
    }
    dispatch_key(session, "keyDown", key, modifiers).await?;
    dispatch_key(session, "keyUp", key, modifiers).await?;
    for name in modifier_names.iter().rev() {
        dispatch_key(session, "keyUp", key_for(name), modifiers).await?;
    }

    Ok(())
}

pub async fn select_all(session: &PageSession, platform_is_mac: bool) -> Result<()> {
    if platform_is_mac {
        press(session, "Meta+a").await
    } else {
        press(session, "Control+a").await
    }
}

pub async fn scroll(session: &PageSession, point: Point, delta_x: f64, delta_y: f64) -> Result<()> {
    session
        .send::<Value>(
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseWheel",
                "x": point.x,
                "y": point.y,
                "deltaX": delta_x,
                "deltaY": delta_y,
            }),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_bitmask_matches_cdp_encoding() {
        let mods = Modifiers { alt: true, control: false, meta: false, shift: true };
        assert_eq!(mods.bitmask(), 1 | 8);
    }

    #[test]
    fn mouse_button_maps_to_cdp_names() {
        assert_eq!(MouseButton::Left.as_cdp(), "left");
        assert_eq!(MouseButton::Right.as_cdp(), "right");
    }
}
