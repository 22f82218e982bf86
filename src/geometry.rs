//! Overlay position math.
//!
//! Positions are kept as a pixel offset inside the overlay's parent plus
//! the matching ratio inside the video's rendered box. Whenever geometry
//! changes the pixels are re-derived from the ratio, then clamped so the
//! whole badge stays over the video.

use serde::{Deserialize, Serialize};

use crate::settings::OverlayPosition;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
  pub left: f64,
  pub top: f64,
  pub width: f64,
  pub height: f64,
}

impl Rect {
  pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
    Self { left, top, width, height }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
  pub width: f64,
  pub height: f64,
}

impl Size {
  pub fn new(width: f64, height: f64) -> Self {
    Self { width, height }
  }
}

/// Live layout the overlay is positioned against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
  pub parent: Rect,
  pub video: Rect,
  pub viewport: Size,
  pub overlay: Size,
}

impl Layout {
  /// Video box in parent coordinates: (offset_x, offset_y, width, height).
  ///
  /// Zero sizes fall back to the parent, then to the viewport.
  pub fn video_box(&self) -> (f64, f64, f64, f64) {
    let width = first_positive([self.video.width, self.parent.width, self.viewport.width]);
    let height = first_positive([self.video.height, self.parent.height, self.viewport.height]);
    (self.video.left - self.parent.left, self.video.top - self.parent.top, width, height)
  }
}

fn first_positive(values: [f64; 3]) -> f64 {
  values.into_iter().find(|v| v.is_finite() && *v > 0.0).unwrap_or(0.0)
}

/// Recompute the pixel position from the stored ratio (when present),
/// then clamp it into the video box.
pub fn resolve(position: &OverlayPosition, layout: &Layout) -> OverlayPosition {
  let (offset_x, offset_y, width, height) = layout.video_box();
  let x = match position.ratio_x {
    Some(ratio) if width > 0.0 => offset_x + ratio * width,
    _ => position.x,
  };
  let y = match position.ratio_y {
    Some(ratio) if height > 0.0 => offset_y + ratio * height,
    _ => position.y,
  };
  commit(x, y, position, layout)
}

/// Clamp a proposed pixel position so the badge's footprint stays inside
/// the video box and derive the matching ratio.
pub fn commit(x: f64, y: f64, previous: &OverlayPosition, layout: &Layout) -> OverlayPosition {
  let (offset_x, offset_y, width, height) = layout.video_box();
  let max_x = offset_x + (width - layout.overlay.width).max(0.0);
  let max_y = offset_y + (height - layout.overlay.height).max(0.0);
  let x = if x.is_finite() { x.clamp(offset_x, max_x) } else { offset_x };
  let y = if y.is_finite() { y.clamp(offset_y, max_y) } else { offset_y };
  let ratio_x = if width > 0.0 { Some(((x - offset_x) / width).clamp(0.0, 1.0)) } else { previous.ratio_x };
  let ratio_y = if height > 0.0 { Some(((y - offset_y) / height).clamp(0.0, 1.0)) } else { previous.ratio_y };
  OverlayPosition { x, y, ratio_x, ratio_y }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn layout(parent: Rect, video: Rect) -> Layout {
    Layout { parent, video, viewport: Size::new(1280.0, 720.0), overlay: Size::new(40.0, 24.0) }
  }

  #[test]
  fn ratio_maps_to_pixels_with_parent_offset() {
    let l = layout(Rect::new(100.0, 50.0, 800.0, 600.0), Rect::new(120.0, 80.0, 640.0, 360.0));
    let p = resolve(&OverlayPosition { x: 0.0, y: 0.0, ratio_x: Some(0.25), ratio_y: Some(0.5) }, &l);
    assert!((p.x - (20.0 + 0.25 * 640.0)).abs() < 1.0);
    assert!((p.y - (30.0 + 0.5 * 360.0)).abs() < 1.0);
  }

  #[test]
  fn pixels_map_back_to_ratio() {
    let l = layout(Rect::new(0.0, 0.0, 640.0, 360.0), Rect::new(10.0, 20.0, 600.0, 300.0));
    let p = commit(160.0, 95.0, &OverlayPosition::default(), &l);
    assert!((p.ratio_x.unwrap() - (160.0 - 10.0) / 600.0).abs() < 0.001);
    assert!((p.ratio_y.unwrap() - (95.0 - 20.0) / 300.0).abs() < 0.001);
  }

  #[test]
  fn footprint_stays_inside_video() {
    let l = layout(Rect::new(0.0, 0.0, 640.0, 360.0), Rect::new(0.0, 0.0, 640.0, 360.0));
    let p = commit(10_000.0, -50.0, &OverlayPosition::default(), &l);
    assert_eq!(p.x, 600.0);
    assert_eq!(p.y, 0.0);
  }

  #[test]
  fn missing_ratio_keeps_pixels() {
    let l = layout(Rect::new(0.0, 0.0, 640.0, 360.0), Rect::new(0.0, 0.0, 640.0, 360.0));
    let p = resolve(&OverlayPosition { x: 33.0, y: 44.0, ratio_x: None, ratio_y: None }, &l);
    assert_eq!((p.x, p.y), (33.0, 44.0));
    assert!(p.ratio_x.is_some());
  }

  #[test]
  fn zero_sized_video_falls_back_to_parent_then_viewport() {
    let l = layout(Rect::new(0.0, 0.0, 500.0, 0.0), Rect::default());
    assert_eq!(l.video_box(), (0.0, 0.0, 500.0, 720.0));
  }

  #[test]
  fn overlay_larger_than_video_pins_to_origin() {
    let mut l = layout(Rect::new(0.0, 0.0, 30.0, 20.0), Rect::new(0.0, 0.0, 30.0, 20.0));
    l.overlay = Size::new(40.0, 24.0);
    let p = commit(15.0, 15.0, &OverlayPosition::default(), &l);
    assert_eq!((p.x, p.y), (0.0, 0.0));
  }
}
