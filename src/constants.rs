//! Tunable constants loaded from `constants.ron` at compile time.
//!
//! The RON file is embedded via `include_str!` so it is always available,
//! with no runtime file I/O. Parsed once on first access via `LazyLock`.

use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;

/// All tuneable constants.
#[derive(Debug, Deserialize)]
pub struct Constants {
  // Playback rate
  pub min_speed: f64,
  pub max_speed: f64,

  // Timers
  pub hold_delay_ms: u64,
  pub flash_ms: u64,

  // Overlay geometry
  pub drag_threshold_px: f64,
  pub fallback_overlay_width: f64,
  pub fallback_overlay_height: f64,
  pub min_font_size: f64,

  // Tolerances
  pub speed_tolerance: f64,
  pub hold_target_tolerance: f64,
  pub step_match_tolerance: f64,
  pub position_px_tolerance: f64,
  pub position_ratio_tolerance: f64,

  // Files
  pub settings_file_name: String,
  pub log_file_name: String,
}

impl Constants {
  pub fn hold_delay(&self) -> Duration {
    Duration::from_millis(self.hold_delay_ms)
  }

  pub fn flash_duration(&self) -> Duration {
    Duration::from_millis(self.flash_ms)
  }
}

static CONSTANTS: LazyLock<Constants> = LazyLock::new(|| {
  // Safety: the RON file is embedded at compile time; if it's malformed this is a build-time error.
  ron::from_str(include_str!("../constants.ron")).expect("constants.ron must be valid RON (embedded at compile time)")
});

/// Returns a reference to the parsed constants.
pub fn constants() -> &'static Constants {
  &CONSTANTS
}

/// `true` when both values are finite and within `threshold` of each other.
pub fn approx_eq(value: f64, target: f64, threshold: f64) -> bool {
  value.is_finite() && target.is_finite() && (value - target).abs() <= threshold
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn embedded_constants_parse() {
    let c = constants();
    assert_eq!(c.hold_delay(), Duration::from_millis(250));
    assert_eq!(c.flash_duration(), Duration::from_millis(1000));
    assert!(c.min_speed < c.max_speed);
  }

  #[test]
  fn approx_eq_rejects_non_finite() {
    assert!(approx_eq(1.005, 1.0, 0.01));
    assert!(!approx_eq(1.02, 1.0, 0.01));
    assert!(!approx_eq(f64::NAN, 1.0, 0.01));
    assert!(!approx_eq(1.0, f64::INFINITY, 0.01));
  }
}
