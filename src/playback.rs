use std::time::Duration;
use tracing::debug;

use crate::constants::constants;
use crate::host::{Host, ListenerId, ListenerKind, NodeId};
use crate::overlay::{Overlay, OverlayOptions};
use crate::settings::OverlayPosition;

/// Binds one overlay to one video and turns speed/seek requests into
/// playback-rate and current-time writes.
pub struct PlaybackController {
  video: NodeId,
  overlay: Overlay,
  rate_listener: Option<ListenerId>,
}

impl PlaybackController {
  /// Create the overlay, attach it and start listening for rate changes.
  pub fn new(host: &mut impl Host, video: NodeId, options: OverlayOptions) -> Self {
    let mut overlay = Overlay::new(host, video, options);
    overlay.attach(host);
    let rate_listener = Some(host.listen(video, ListenerKind::RateChange));
    Self { video, overlay, rate_listener }
  }

  pub fn video(&self) -> NodeId {
    self.video
  }

  pub fn overlay(&self) -> &Overlay {
    &self.overlay
  }

  pub fn overlay_mut(&mut self) -> &mut Overlay {
    &mut self.overlay
  }

  /// Current rate, `1.0` when the media reports nothing usable.
  pub fn rate(&self, host: &impl Host) -> f64 {
    let rate = host.playback_rate(self.video);
    if rate.is_finite() && rate > 0.0 { rate } else { 1.0 }
  }

  /// Clamp, apply and display a playback rate. Returns the applied value.
  pub fn set_speed(&mut self, host: &mut impl Host, value: f64) -> f64 {
    let c = constants();
    let next = if value.is_finite() { value.clamp(c.min_speed, c.max_speed) } else { 1.0 };
    host.set_playback_rate(self.video, next);
    self.overlay.update(host, next);
    next
  }

  pub fn change_speed(&mut self, host: &mut impl Host, delta: f64) -> f64 {
    let current = self.rate(&*host);
    self.set_speed(host, current + delta)
  }

  pub fn rewind(&mut self, host: &mut impl Host, seconds: f64) {
    self.seek_by(host, -seconds.abs());
    self.flash_overlay(host, constants().flash_duration());
  }

  pub fn advance(&mut self, host: &mut impl Host, seconds: f64) {
    self.seek_by(host, seconds.abs());
    self.flash_overlay(host, constants().flash_duration());
  }

  fn seek_by(&mut self, host: &mut impl Host, seconds: f64) {
    let current = host.current_time(self.video);
    let current = if current.is_finite() { current } else { 0.0 };
    let target = current + seconds;
    let target = match host.duration(self.video) {
      Some(duration) => target.clamp(0.0, duration.max(0.0)),
      None => target.max(0.0),
    };
    if let Err(e) = host.set_current_time(self.video, target) {
      debug!(video = ?self.video, err = %e, "playback: seek ignored");
    }
  }

  /// Re-render after any rate change, ours or the page's own controls.
  /// Returns the observed rate so the owner can fold it into its state.
  pub fn handle_rate_change(&mut self, host: &mut impl Host) -> f64 {
    let rate = self.rate(&*host);
    self.overlay.update(host, rate);
    rate
  }

  pub fn set_overlay_visibility(&mut self, host: &mut impl Host, visible: bool) {
    self.overlay.set_visible(host, visible);
  }

  pub fn set_overlay_appearance(&mut self, host: &mut impl Host, font_size: f64, background_alpha: f64) {
    self.overlay.set_appearance(host, Some(font_size), Some(background_alpha));
  }

  pub fn set_overlay_position(&mut self, host: &mut impl Host, position: OverlayPosition) {
    self.overlay.set_position(host, position);
  }

  pub fn set_rewind_advance_step(&mut self, host: &mut impl Host, seconds: f64) {
    self.overlay.set_step_seconds(host, Some(seconds));
  }

  pub fn flash_overlay(&mut self, host: &mut impl Host, duration: Duration) {
    self.overlay.show_temporarily(host, duration);
  }

  pub fn destroy(&mut self, host: &mut impl Host) {
    if let Some(id) = self.rate_listener.take() {
      host.unlisten(id);
    }
    self.overlay.detach(host);
  }
}
