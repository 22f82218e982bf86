//! User settings snapshot and its normalization rules.
//!
//! Settings arrive from storage as loosely typed data. Every field is
//! normalized on its own: a bad value falls back to its default without
//! disturbing the other fields, numbers are clamped to their range and the
//! selected rewind/advance step is always one of the presets.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{approx_eq, constants};

// --- Types ---

/// Overlay position: pixel offset inside the overlay's parent plus the
/// same point expressed as a fraction of the video's rendered size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayPosition {
  pub x: f64,
  pub y: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ratio_x: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ratio_y: Option<f64>,
}

impl Default for OverlayPosition {
  fn default() -> Self {
    Self { x: 0.0, y: 0.0, ratio_x: Some(0.01), ratio_y: Some(0.05) }
  }
}

/// Immutable, fully normalized settings snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
  pub reset_key: String,
  pub decrease_key: String,
  pub increase_key: String,
  pub rewind_key: String,
  pub advance_key: String,
  pub cycle_step_key: String,
  pub toggle_overlay_key: String,
  pub speed_step: f64,
  pub rewind_advance_steps: Vec<f64>,
  pub rewind_advance_current_step: f64,
  pub prefer_speed: f64,
  pub fast_forward_speed: f64,
  pub slow_motion_speed: f64,
  pub overlay_font_size: f64,
  pub overlay_background_alpha: f64,
  pub show_current_speed: bool,
  pub overlay_position: OverlayPosition,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      reset_key: "a".to_string(),
      decrease_key: "s".to_string(),
      increase_key: "d".to_string(),
      rewind_key: "z".to_string(),
      advance_key: "x".to_string(),
      cycle_step_key: "e".to_string(),
      toggle_overlay_key: "v".to_string(),
      speed_step: 0.1,
      rewind_advance_steps: DEFAULT_STEPS.to_vec(),
      rewind_advance_current_step: 10.0,
      prefer_speed: 1.3,
      fast_forward_speed: 2.0,
      slow_motion_speed: 0.5,
      overlay_font_size: 18.0,
      overlay_background_alpha: 0.5,
      overlay_position: OverlayPosition::default(),
      show_current_speed: true,
    }
  }
}

/// Partial update merged into the current snapshot by a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reset_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub decrease_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub increase_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rewind_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub advance_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cycle_step_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub toggle_overlay_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub speed_step: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rewind_advance_steps: Option<Vec<f64>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rewind_advance_current_step: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub prefer_speed: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fast_forward_speed: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub slow_motion_speed: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub overlay_font_size: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub overlay_background_alpha: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub overlay_position: Option<OverlayPosition>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub show_current_speed: Option<bool>,
}

impl From<&Settings> for SettingsPatch {
  fn from(s: &Settings) -> Self {
    Self {
      reset_key: Some(s.reset_key.clone()),
      decrease_key: Some(s.decrease_key.clone()),
      increase_key: Some(s.increase_key.clone()),
      rewind_key: Some(s.rewind_key.clone()),
      advance_key: Some(s.advance_key.clone()),
      cycle_step_key: Some(s.cycle_step_key.clone()),
      toggle_overlay_key: Some(s.toggle_overlay_key.clone()),
      speed_step: Some(s.speed_step),
      rewind_advance_steps: Some(s.rewind_advance_steps.clone()),
      rewind_advance_current_step: Some(s.rewind_advance_current_step),
      prefer_speed: Some(s.prefer_speed),
      fast_forward_speed: Some(s.fast_forward_speed),
      slow_motion_speed: Some(s.slow_motion_speed),
      overlay_font_size: Some(s.overlay_font_size),
      overlay_background_alpha: Some(s.overlay_background_alpha),
      overlay_position: Some(s.overlay_position),
      show_current_speed: Some(s.show_current_speed),
    }
  }
}

// --- Ranges ---

pub const DEFAULT_STEPS: [f64; 3] = [2.0, 5.0, 10.0];

const SPEED_STEP_RANGE: (f64, f64) = (0.1, 16.0);
const STEP_RANGE: (f64, f64) = (0.1, 600.0);
const PREFER_SPEED_RANGE: (f64, f64) = (0.1, 16.0);
const FAST_FORWARD_RANGE: (f64, f64) = (1.0, 16.0);
const SLOW_MOTION_RANGE: (f64, f64) = (0.1, 1.0);
const FONT_SIZE_RANGE: (f64, f64) = (8.0, 72.0);
const ALPHA_RANGE: (f64, f64) = (0.1, 1.0);
const POSITION_RANGE: (f64, f64) = (0.0, 10000.0);

/// Field names accepted by [`Settings::with_field`].
pub const FIELD_NAMES: [&str; 17] = [
  "reset_key",
  "decrease_key",
  "increase_key",
  "rewind_key",
  "advance_key",
  "cycle_step_key",
  "toggle_overlay_key",
  "speed_step",
  "rewind_advance_steps",
  "rewind_advance_current_step",
  "prefer_speed",
  "fast_forward_speed",
  "slow_motion_speed",
  "overlay_font_size",
  "overlay_background_alpha",
  "overlay_position",
  "show_current_speed",
];

// --- Normalization ---

impl Settings {
  /// Build a normalized snapshot from loosely typed stored data.
  ///
  /// Missing fields take their default, present-but-invalid fields do too.
  pub fn from_value(value: &Value) -> Self {
    let empty = Map::new();
    let map = value.as_object().unwrap_or(&empty);
    let d = Settings::default();

    let rewind_advance_steps = sanitize_steps(map.get("rewind_advance_steps"));
    let current = sanitize_number(map.get("rewind_advance_current_step"), d.rewind_advance_current_step, STEP_RANGE);
    let rewind_advance_current_step = resolve_current_step(&rewind_advance_steps, current);

    Self {
      reset_key: sanitize_key(map.get("reset_key"), &d.reset_key),
      decrease_key: sanitize_key(map.get("decrease_key"), &d.decrease_key),
      increase_key: sanitize_key(map.get("increase_key"), &d.increase_key),
      rewind_key: sanitize_key(map.get("rewind_key"), &d.rewind_key),
      advance_key: sanitize_key(map.get("advance_key"), &d.advance_key),
      cycle_step_key: sanitize_key(map.get("cycle_step_key"), &d.cycle_step_key),
      toggle_overlay_key: sanitize_key(map.get("toggle_overlay_key"), &d.toggle_overlay_key),
      speed_step: sanitize_number(map.get("speed_step"), d.speed_step, SPEED_STEP_RANGE),
      rewind_advance_steps,
      rewind_advance_current_step,
      prefer_speed: sanitize_number(map.get("prefer_speed"), d.prefer_speed, PREFER_SPEED_RANGE),
      fast_forward_speed: sanitize_number(map.get("fast_forward_speed"), d.fast_forward_speed, FAST_FORWARD_RANGE),
      slow_motion_speed: sanitize_number(map.get("slow_motion_speed"), d.slow_motion_speed, SLOW_MOTION_RANGE),
      overlay_font_size: sanitize_number(map.get("overlay_font_size"), d.overlay_font_size, FONT_SIZE_RANGE),
      overlay_background_alpha: sanitize_number(
        map.get("overlay_background_alpha"),
        d.overlay_background_alpha,
        ALPHA_RANGE,
      ),
      overlay_position: sanitize_position(map.get("overlay_position"), &d.overlay_position),
      show_current_speed: map.get("show_current_speed").and_then(Value::as_bool).unwrap_or(d.show_current_speed),
    }
  }

  pub fn to_value(&self) -> Value {
    serde_json::to_value(self).unwrap_or_default()
  }

  /// Re-apply every normalization rule to this snapshot.
  pub fn normalized(&self) -> Self {
    Self::from_value(&self.to_value())
  }

  /// Merge a partial update and normalize the result.
  pub fn merged(&self, patch: &SettingsPatch) -> Self {
    let mut map = match self.to_value() {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    if let Value::Object(changes) = serde_json::to_value(patch).unwrap_or_default() {
      map.extend(changes);
    }
    Self::from_value(&Value::Object(map))
  }

  /// Replace one field from an untyped value, as typed on a command line.
  pub fn with_field(&self, field: &str, value: Value) -> Result<Self> {
    if !FIELD_NAMES.contains(&field) {
      return Err(anyhow!("Unknown settings field '{}'. Known fields: {}", field, FIELD_NAMES.join(", ")));
    }
    let mut map = match self.to_value() {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    map.insert(field.to_string(), value);
    Ok(Self::from_value(&Value::Object(map)))
  }

  /// Rewind/advance step currently in effect.
  pub fn current_step(&self) -> f64 {
    self.rewind_advance_current_step
  }

  /// Next preset after the current one, wrapping around.
  pub fn next_step(&self) -> f64 {
    let steps = &self.rewind_advance_steps;
    let tolerance = constants().step_match_tolerance;
    let next = steps
      .iter()
      .position(|step| approx_eq(*step, self.rewind_advance_current_step, tolerance))
      .map_or(0, |i| (i + 1) % steps.len());
    steps.get(next).copied().unwrap_or(DEFAULT_STEPS[0])
  }
}

fn sanitize_key(value: Option<&Value>, fallback: &str) -> String {
  match value.and_then(Value::as_str) {
    Some(key) if !key.is_empty() => key.to_lowercase(),
    _ => fallback.to_string(),
  }
}

fn parse_number(value: &Value) -> Option<f64> {
  let parsed = match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok(),
    _ => None,
  };
  parsed.filter(|n| n.is_finite())
}

fn sanitize_number(value: Option<&Value>, fallback: f64, (min, max): (f64, f64)) -> f64 {
  value.and_then(parse_number).map_or(fallback, |n| n.clamp(min, max))
}

fn sanitize_steps(value: Option<&Value>) -> Vec<f64> {
  let parsed: Vec<f64> = match value {
    Some(Value::Array(items)) => items.iter().filter_map(parse_number).collect(),
    Some(Value::String(s)) => {
      s.split(|c: char| c == ',' || c.is_whitespace()).filter_map(|part| part.parse::<f64>().ok()).collect()
    }
    _ => Vec::new(),
  };
  let (min, max) = STEP_RANGE;
  let steps: Vec<f64> = parsed.into_iter().filter(|n| n.is_finite() && *n >= min && *n <= max).collect();
  if steps.is_empty() { DEFAULT_STEPS.to_vec() } else { steps }
}

fn resolve_current_step(steps: &[f64], current: f64) -> f64 {
  let tolerance = constants().step_match_tolerance;
  steps
    .iter()
    .copied()
    .find(|step| approx_eq(*step, current, tolerance))
    .or_else(|| steps.first().copied())
    .unwrap_or(DEFAULT_STEPS[0])
}

fn sanitize_ratio(value: Option<&Value>, fallback: Option<f64>) -> Option<f64> {
  match value.and_then(Value::as_f64) {
    Some(ratio) if ratio.is_finite() => Some(ratio.clamp(0.0, 1.0)),
    _ => fallback,
  }
}

fn sanitize_position(value: Option<&Value>, fallback: &OverlayPosition) -> OverlayPosition {
  let empty = Map::new();
  let map = value.and_then(Value::as_object).unwrap_or(&empty);
  OverlayPosition {
    x: sanitize_number(map.get("x"), fallback.x, POSITION_RANGE),
    y: sanitize_number(map.get("y"), fallback.y, POSITION_RANGE),
    ratio_x: sanitize_ratio(map.get("ratio_x"), fallback.ratio_x),
    ratio_y: sanitize_ratio(map.get("ratio_y"), fallback.ratio_y),
  }
}
