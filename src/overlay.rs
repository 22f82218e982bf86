//! Speed badge drawn over one video.
//!
//! The overlay owns rendering, drag interaction and position math only;
//! it never touches playback. Visibility is the OR of a persistent flag and
//! a temporary flash that hides itself after a timer.

use std::time::Duration;
use tracing::debug;

use crate::constants::constants;
use crate::geometry::{self, Layout, Rect, Size};
use crate::host::{
  CssPosition, Disposition, Host, ListenerId, ListenerKind, NodeId, OverlayView, PointerEvent, PointerType, TimerId,
  TimerTask,
};
use crate::settings::OverlayPosition;

/// Initial state handed to [`Overlay::new`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayOptions {
  pub visible: bool,
  pub font_size: f64,
  pub background_alpha: f64,
  pub position: OverlayPosition,
  pub step_seconds: Option<f64>,
}

impl Default for OverlayOptions {
  fn default() -> Self {
    Self { visible: true, font_size: 18.0, background_alpha: 0.5, position: OverlayPosition::default(), step_seconds: None }
  }
}

struct Attachment {
  parent: NodeId,
  /// Inline position to restore when we forced `relative` on the parent.
  forced_from: Option<Option<CssPosition>>,
  listeners: Vec<ListenerId>,
}

struct DragState {
  pointer_id: i32,
  start: (f64, f64),
  start_position: OverlayPosition,
  moved: bool,
  listeners: Vec<ListenerId>,
}

pub struct Overlay {
  video: NodeId,
  element: NodeId,
  visible: bool,
  temp_visible: bool,
  temp_timer: Option<TimerId>,
  font_size: f64,
  background_alpha: f64,
  position: OverlayPosition,
  rate: f64,
  step_seconds: Option<f64>,
  attachment: Option<Attachment>,
  drag: Option<DragState>,
}

impl Overlay {
  pub fn new(host: &mut impl Host, video: NodeId, options: OverlayOptions) -> Self {
    let element = host.create_overlay();
    let mut overlay = Self {
      video,
      element,
      visible: options.visible,
      temp_visible: false,
      temp_timer: None,
      font_size: options.font_size,
      background_alpha: options.background_alpha,
      position: options.position,
      rate: 1.0,
      step_seconds: options.step_seconds.filter(|s| s.is_finite()),
      attachment: None,
      drag: None,
    };
    overlay.rate = sanitize_rate(host.playback_rate(video));
    overlay.apply_position(host);
    overlay
  }

  pub fn element(&self) -> NodeId {
    self.element
  }

  pub fn is_attached(&self) -> bool {
    self.attachment.is_some()
  }

  pub fn is_shown(&self) -> bool {
    self.visible || self.temp_visible
  }

  pub fn is_dragging(&self) -> bool {
    self.drag.is_some()
  }

  pub fn position(&self) -> OverlayPosition {
    self.position
  }

  pub fn label(&self) -> String {
    format_label(self.rate, self.step_seconds)
  }

  // --- Lifecycle ---

  /// Insert the badge next to the video. No-op when already attached.
  pub fn attach(&mut self, host: &mut impl Host) {
    if self.attachment.is_some() {
      return;
    }

    let parent = self.resolve_parent(&*host);
    let forced_from = if host.computed_position(parent) == CssPosition::Static {
      let original = host.inline_position(parent);
      host.set_inline_position(parent, Some(CssPosition::Relative));
      Some(original)
    } else {
      None
    };
    host.append_child(parent, self.element);

    let document = host.document();
    let mut listeners = vec![
      host.listen(self.element, ListenerKind::Click),
      host.listen(self.element, ListenerKind::PointerDown),
      host.listen(document, ListenerKind::ViewportResize),
      host.listen(document, ListenerKind::FullscreenChange),
    ];
    if host.supports_resize_observer() {
      listeners.push(host.listen(self.video, ListenerKind::VideoResize));
    }

    self.attachment = Some(Attachment { parent, forced_from, listeners });
    debug!(video = ?self.video, parent = ?parent, "overlay: attached");
    self.apply_position(host);
  }

  /// Remove the badge and undo everything `attach` changed. Idempotent.
  pub fn detach(&mut self, host: &mut impl Host) {
    let Some(attachment) = self.attachment.take() else {
      return;
    };

    self.stop_dragging(host);
    if let Some(timer) = self.temp_timer.take() {
      host.clear_timeout(timer);
    }
    self.temp_visible = false;
    for id in attachment.listeners {
      host.unlisten(id);
    }
    host.remove_child(self.element);
    if let Some(original) = attachment.forced_from {
      host.set_inline_position(attachment.parent, original);
    }
    debug!(video = ?self.video, "overlay: detached");
  }

  /// Move the badge to the video's current parent after the video was
  /// re-parented. No-op while detached or when the parent is unchanged.
  pub fn reanchor(&mut self, host: &mut impl Host) {
    let Some(attachment) = &self.attachment else {
      return;
    };
    if attachment.parent == self.resolve_parent(&*host) {
      return;
    }
    let temp_visible = self.temp_visible;
    self.detach(host);
    self.attach(host);
    if temp_visible {
      self.show_temporarily(host, constants().flash_duration());
    }
  }

  fn resolve_parent(&self, host: &impl Host) -> NodeId {
    match host.parent_element(self.video) {
      Some(parent) => host.shadow_host(parent).unwrap_or(parent),
      None => host.shadow_host(self.video).unwrap_or_else(|| host.document()),
    }
  }

  // --- State ---

  pub fn update(&mut self, host: &mut impl Host, rate: f64) {
    self.rate = sanitize_rate(rate);
    self.render(host);
  }

  pub fn set_step_seconds(&mut self, host: &mut impl Host, step: Option<f64>) {
    self.step_seconds = step.filter(|s| s.is_finite());
    self.render(host);
  }

  pub fn set_visible(&mut self, host: &mut impl Host, visible: bool) {
    self.visible = visible;
    self.render(host);
  }

  /// Show for `duration`, restarting the countdown if already flashing.
  pub fn show_temporarily(&mut self, host: &mut impl Host, duration: Duration) {
    self.temp_visible = true;
    if let Some(timer) = self.temp_timer.take() {
      host.clear_timeout(timer);
    }
    self.temp_timer = Some(host.set_timeout(duration, TimerTask::HideOverlay { video: self.video }));
    self.render(host);
  }

  /// Returns `true` when `id` was this overlay's hide timer.
  pub fn handle_timer(&mut self, host: &mut impl Host, id: TimerId) -> bool {
    if self.temp_timer != Some(id) {
      return false;
    }
    self.temp_timer = None;
    self.temp_visible = false;
    self.render(host);
    true
  }

  pub fn set_appearance(&mut self, host: &mut impl Host, font_size: Option<f64>, background_alpha: Option<f64>) {
    if let Some(size) = font_size.filter(|v| v.is_finite()) {
      self.font_size = size;
    }
    if let Some(alpha) = background_alpha.filter(|v| v.is_finite()) {
      self.background_alpha = alpha;
    }
    self.render(host);
  }

  pub fn set_position(&mut self, host: &mut impl Host, position: OverlayPosition) {
    self.position = position;
    self.apply_position(host);
  }

  // --- Geometry ---

  fn layout(&self, host: &impl Host) -> Layout {
    let viewport = host.viewport();
    let fallback = Rect::new(0.0, 0.0, viewport.width, viewport.height);
    let parent_node = self.attachment.as_ref().map(|a| a.parent).or_else(|| host.parent_element(self.video));
    let parent = parent_node.and_then(|p| host.bounding_rect(p)).unwrap_or(fallback);
    let video = host.bounding_rect(self.video).unwrap_or(parent);
    let c = constants();
    let overlay = host
      .element_size(self.element)
      .filter(|s| s.width > 0.0 && s.height > 0.0)
      .unwrap_or(Size::new(c.fallback_overlay_width, c.fallback_overlay_height));
    Layout { parent, video, viewport, overlay }
  }

  /// Re-derive pixels from the ratio against the live layout. Called on
  /// attach, viewport resize, fullscreen change and video resize.
  pub fn apply_position(&mut self, host: &mut impl Host) {
    let layout = self.layout(&*host);
    self.position = geometry::resolve(&self.position, &layout);
    self.render(host);
  }

  // --- Drag ---

  pub fn pointer_down(&mut self, host: &mut impl Host, event: PointerEvent) -> Disposition {
    if event.pointer_type == PointerType::Mouse && event.button != 0 {
      return Disposition::Ignored;
    }
    self.stop_dragging(host);
    host.set_pointer_capture(self.element, event.pointer_id);
    let listeners = vec![
      host.listen(self.element, ListenerKind::PointerMove),
      host.listen(self.element, ListenerKind::PointerUp),
      host.listen(self.element, ListenerKind::PointerCancel),
    ];
    self.drag = Some(DragState {
      pointer_id: event.pointer_id,
      start: (event.x, event.y),
      start_position: self.position,
      moved: false,
      listeners,
    });
    self.render(host);
    Disposition::Consumed
  }

  pub fn pointer_move(&mut self, host: &mut impl Host, event: PointerEvent) -> Disposition {
    let Some(drag) = self.drag.as_mut() else {
      return Disposition::Ignored;
    };
    let dx = event.x - drag.start.0;
    let dy = event.y - drag.start.1;
    let threshold = constants().drag_threshold_px;
    if dx.abs() > threshold || dy.abs() > threshold {
      drag.moved = true;
    }
    let proposed = (drag.start_position.x + dx, drag.start_position.y + dy);
    let layout = self.layout(&*host);
    self.position = geometry::commit(proposed.0, proposed.1, &self.position, &layout);
    self.render(host);
    Disposition::Ignored
  }

  /// Ends a drag. Returns the final position when the pointer actually
  /// moved; plain clicks report nothing.
  pub fn pointer_up(&mut self, host: &mut impl Host) -> (Disposition, Option<OverlayPosition>) {
    let Some(drag) = self.drag.take() else {
      return (Disposition::Ignored, None);
    };
    host.release_pointer_capture(self.element, drag.pointer_id);
    for id in drag.listeners {
      host.unlisten(id);
    }
    self.render(host);
    if drag.moved {
      debug!(video = ?self.video, x = self.position.x, y = self.position.y, "overlay: drag finished");
      (Disposition::Consumed, Some(self.position))
    } else {
      (Disposition::Ignored, None)
    }
  }

  fn stop_dragging(&mut self, host: &mut impl Host) {
    if let Some(drag) = self.drag.take() {
      host.release_pointer_capture(self.element, drag.pointer_id);
      for id in drag.listeners {
        host.unlisten(id);
      }
    }
  }

  /// Clicks on the badge never reach the page underneath.
  pub fn click(&self) -> Disposition {
    Disposition::Consumed
  }

  // --- Rendering ---

  fn render(&self, host: &mut impl Host) {
    let c = constants();
    let view = OverlayView {
      text: self.label(),
      visible: self.is_shown(),
      dragging: self.drag.is_some(),
      left: self.position.x,
      top: self.position.y,
      font_size: if self.font_size.is_finite() { self.font_size.max(c.min_font_size) } else { 14.0 },
      background_alpha: if self.background_alpha.is_finite() { self.background_alpha.clamp(0.1, 1.0) } else { 0.7 },
    };
    host.render_overlay(self.element, &view);
  }
}

fn sanitize_rate(rate: f64) -> f64 {
  if rate.is_finite() && rate != 0.0 { rate } else { 1.0 }
}

/// `1.5×`, or `1.5×/10` when a step is shown. Whole steps drop the decimal.
pub fn format_label(rate: f64, step: Option<f64>) -> String {
  let speed = format!("{:.1}×", rate);
  match step {
    Some(step) if (step - step.round()).abs() < 0.001 => format!("{}/{}", speed, step.round() as i64),
    Some(step) => format!("{}/{:.1}", speed, step),
    None => speed,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::{Dom, Scheduler};
  use crate::sim::{SimDocument, VideoSpec};

  fn setup() -> (SimDocument, NodeId, NodeId) {
    let mut doc = SimDocument::new();
    let container = doc.create_element("div");
    doc.set_rect(container, Rect::new(0.0, 0.0, 640.0, 360.0));
    let root = doc.document();
    doc.append(root, container);
    let video = doc.create_video(VideoSpec { width: 640.0, height: 360.0, ..Default::default() });
    doc.append(container, video);
    (doc, container, video)
  }

  fn pointer(x: f64, y: f64) -> PointerEvent {
    PointerEvent { pointer_id: 1, x, y, ..Default::default() }
  }

  #[test]
  fn label_formats() {
    assert_eq!(format_label(1.0, None), "1.0×");
    assert_eq!(format_label(1.3, Some(10.0)), "1.3×/10");
    assert_eq!(format_label(2.0, Some(2.5)), "2.0×/2.5");
    assert_eq!(format_label(1.5, Some(5.0004)), "1.5×/5");
  }

  #[test]
  fn attach_twice_leaves_one_badge() {
    let (mut doc, container, video) = setup();
    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    overlay.attach(&mut doc);
    assert_eq!(doc.overlays_under(container), vec![overlay.element()]);

    overlay.detach(&mut doc);
    overlay.detach(&mut doc);
    assert!(doc.overlays_under(container).is_empty());
    assert!(!overlay.is_attached());
  }

  #[test]
  fn static_parent_is_forced_relative_and_restored() {
    let (mut doc, container, video) = setup();
    doc.set_inline_position(container, Some(CssPosition::Static));
    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    assert_eq!(doc.inline_position(container), Some(CssPosition::Relative));
    overlay.detach(&mut doc);
    assert_eq!(doc.inline_position(container), Some(CssPosition::Static));
  }

  #[test]
  fn positioned_parent_is_left_alone() {
    let (mut doc, container, video) = setup();
    doc.set_computed_position(container, CssPosition::Absolute);
    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    assert_eq!(doc.inline_position(container), None);
    overlay.detach(&mut doc);
    assert_eq!(doc.inline_position(container), None);
  }

  #[test]
  fn video_in_shadow_root_anchors_to_host() {
    let mut doc = SimDocument::new();
    let host_el = doc.create_element("player-shell");
    let root = doc.document();
    doc.append(root, host_el);
    let shadow = doc.attach_shadow(host_el);
    let video = doc.create_video(VideoSpec::default());
    doc.append(shadow, video);

    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    assert_eq!(doc.overlays_under(host_el), vec![overlay.element()]);
  }

  #[test]
  fn temporary_visibility_expires_and_restarts() {
    let (mut doc, _, video) = setup();
    let options = OverlayOptions { visible: false, ..Default::default() };
    let mut overlay = Overlay::new(&mut doc, video, options);
    overlay.attach(&mut doc);
    assert!(!overlay.is_shown());

    overlay.show_temporarily(&mut doc, Duration::from_millis(1000));
    assert!(overlay.is_shown());
    doc.advance_clock(Duration::from_millis(800));
    overlay.show_temporarily(&mut doc, Duration::from_millis(1000));
    assert_eq!(doc.pending_timers(), 1);

    let due = doc.take_due_timers(doc.now() + Duration::from_millis(1000));
    assert_eq!(due.len(), 1);
    let (id, _) = due[0];
    assert!(overlay.handle_timer(&mut doc, id));
    assert!(!overlay.is_shown());
    assert!(!doc.overlay_view(overlay.element()).unwrap().visible);
  }

  #[test]
  fn detach_cancels_pending_flash() {
    let (mut doc, _, video) = setup();
    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    overlay.show_temporarily(&mut doc, Duration::from_millis(1000));
    overlay.detach(&mut doc);
    assert_eq!(doc.pending_timers(), 0);
  }

  #[test]
  fn appearance_floors_font_and_clamps_alpha() {
    let (mut doc, _, video) = setup();
    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    overlay.set_appearance(&mut doc, Some(2.0), Some(3.0));
    let view = doc.overlay_view(overlay.element()).unwrap();
    assert_eq!(view.font_size, 6.0);
    assert_eq!(view.background_alpha, 1.0);
    overlay.set_appearance(&mut doc, None, Some(0.0));
    let view = doc.overlay_view(overlay.element()).unwrap();
    assert_eq!(view.font_size, 6.0);
    assert_eq!(view.background_alpha, 0.1);
  }

  #[test]
  fn drag_reports_ratio_of_final_pixels() {
    let (mut doc, _, video) = setup();
    let options = OverlayOptions {
      position: OverlayPosition { x: 0.0, y: 0.0, ratio_x: Some(0.0), ratio_y: Some(0.0) },
      ..Default::default()
    };
    let mut overlay = Overlay::new(&mut doc, video, options);
    overlay.attach(&mut doc);

    assert!(overlay.pointer_down(&mut doc, pointer(5.0, 5.0)).is_consumed());
    assert!(overlay.is_dragging());
    overlay.pointer_move(&mut doc, pointer(165.0, 95.0));
    let (disposition, reported) = overlay.pointer_up(&mut doc);
    assert!(disposition.is_consumed());
    let reported = reported.unwrap();
    assert_eq!((reported.x, reported.y), (160.0, 90.0));
    assert!((reported.ratio_x.unwrap() - 160.0 / 640.0).abs() < 0.001);
    assert!((reported.ratio_y.unwrap() - 90.0 / 360.0).abs() < 0.001);
    assert!(!overlay.is_dragging());
  }

  #[test]
  fn click_without_movement_reports_nothing() {
    let (mut doc, _, video) = setup();
    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    overlay.pointer_down(&mut doc, pointer(5.0, 5.0));
    overlay.pointer_move(&mut doc, pointer(5.5, 5.5));
    let (disposition, reported) = overlay.pointer_up(&mut doc);
    assert_eq!(disposition, Disposition::Ignored);
    assert!(reported.is_none());
    assert!(overlay.click().is_consumed());
  }

  #[test]
  fn secondary_mouse_button_does_not_drag() {
    let (mut doc, _, video) = setup();
    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    let event = PointerEvent { button: 2, ..pointer(0.0, 0.0) };
    assert_eq!(overlay.pointer_down(&mut doc, event), Disposition::Ignored);
    assert!(!overlay.is_dragging());
    assert!(!doc.has_listener(overlay.element(), ListenerKind::PointerMove));
  }

  #[test]
  fn drag_listeners_only_live_during_drag() {
    let (mut doc, _, video) = setup();
    let mut overlay = Overlay::new(&mut doc, video, OverlayOptions::default());
    overlay.attach(&mut doc);
    overlay.pointer_down(&mut doc, pointer(0.0, 0.0));
    assert!(doc.has_listener(overlay.element(), ListenerKind::PointerMove));
    assert_eq!(doc.pointer_capture(), Some((overlay.element(), 1)));
    overlay.pointer_up(&mut doc);
    assert!(!doc.has_listener(overlay.element(), ListenerKind::PointerMove));
    assert_eq!(doc.pointer_capture(), None);
  }

  #[test]
  fn resize_reanchors_from_ratio() {
    let (mut doc, container, video) = setup();
    let options = OverlayOptions {
      position: OverlayPosition { x: 0.0, y: 0.0, ratio_x: Some(0.5), ratio_y: Some(0.5) },
      ..Default::default()
    };
    let mut overlay = Overlay::new(&mut doc, video, options);
    overlay.attach(&mut doc);
    assert_eq!((overlay.position().x, overlay.position().y), (320.0, 180.0));

    doc.set_rect(container, Rect::new(0.0, 0.0, 1280.0, 720.0));
    doc.set_rect(video, Rect::new(0.0, 0.0, 1280.0, 720.0));
    overlay.apply_position(&mut doc);
    assert_eq!((overlay.position().x, overlay.position().y), (640.0, 360.0));
  }
}
