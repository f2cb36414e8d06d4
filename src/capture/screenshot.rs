//! Screenshot capture. Returns raw bytes; saving to disk is the caller's
//! concern (the external file-I/O collaborator).

use base64::Engine;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::page_session::PageSession;
use crate::resolve::BoundingBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Png,
    Jpeg,
    Webp,
}

impl Format {
    fn as_cdp(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
        }
    }

    fn accepts_quality(self) -> bool {
        !matches!(self, Self::Png)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy)]
pub enum Mode {
    Viewport,
    FullPage,
    Region(Rect),
    Element { bounding_box: BoundingBox, padding: i32 },
}

#[derive(Debug, Clone, Copy)]
pub struct ScreenshotOptions {
    pub format: Format,
    pub quality: Option<u8>,
    pub mode: Mode,
}

fn validate(options: &ScreenshotOptions) -> Result<()> {
    if let Some(quality) = options.quality {
        if !options.format.accepts_quality() {
            return Err(Error::step_validation(format!(
                "quality is not accepted for format {:?}",
                options.format
            )));
        }
        if quality > 100 {
            return Err(Error::step_validation("quality must be in [0,100]"));
        }
    }
    Ok(())
}

fn clip_for(mode: Mode) -> Option<Rect> {
    match mode {
        Mode::Viewport => None,
        Mode::FullPage => None,
        Mode::Region(rect) => Some(rect),
        Mode::Element { bounding_box, padding } => {
            let padding = padding.max(0) as f64;
            let x = (bounding_box.x - padding).max(0.0);
            let y = (bounding_box.y - padding).max(0.0);
            Some(Rect {
                x,
                y,
                width: bounding_box.width + 2.0 * padding,
                height: bounding_box.height + 2.0 * padding,
            })
        }
    }
}

pub async fn capture(session: &PageSession, options: ScreenshotOptions) -> Result<Vec<u8>> {
    validate(&options)?;

    let mut params = json!({ "format": options.format.as_cdp() });
    if let Some(quality) = options.quality {
        params["quality"] = json!(quality);
    }

    if matches!(options.mode, Mode::FullPage) {
        let metrics: Value = session.send("Page.getLayoutMetrics", json!({})).await?;
        if let Some(content_size) = metrics.get("cssContentSize").or_else(|| metrics.get("contentSize")) {
            params["clip"] = json!({
                "x": 0,
                "y": 0,
                "width": content_size.get("width").and_then(|v| v.as_f64()).unwrap_or(0.0),
                "height": content_size.get("height").and_then(|v| v.as_f64()).unwrap_or(0.0),
                "scale": 1,
            });
            params["captureBeyondViewport"] = json!(true);
        }
    } else if let Some(clip) = clip_for(options.mode) {
        params["clip"] = json!({ "x": clip.x, "y": clip.y, "width": clip.width, "height": clip.height, "scale": 1 });
    }

    let result: Value = session.send("Page.captureScreenshot", params).await?;
    let encoded = result
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::protocol("Page.captureScreenshot missing data"))?;

    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::protocol(format!("failed to decode screenshot data: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_rejects_quality() {
        let options = ScreenshotOptions { format: Format::Png, quality: Some(80), mode: Mode::Viewport };
        assert!(validate(&options).is_err());
    }

    #[test]
    fn jpeg_accepts_quality_in_range() {
        let options = ScreenshotOptions { format: Format::Jpeg, quality: Some(80), mode: Mode::Viewport };
        assert!(validate(&options).is_ok());
    }

    #[test]
    fn quality_above_100_is_rejected() {
        let options = ScreenshotOptions { format: Format::Webp, quality: Some(150), mode: Mode::Viewport };
        assert!(validate(&options).is_err());
    }

    #[test]
    fn element_mode_clamps_padding_to_nonnegative_origin() {
        let bounding_box = BoundingBox { x: 5.0, y: 5.0, width: 20.0, height: 10.0 };
        let clip = clip_for(Mode::Element { bounding_box, padding: 20 }).unwrap();
        assert_eq!(clip.x, 0.0);
        assert_eq!(clip.y, 0.0);
    }
}
