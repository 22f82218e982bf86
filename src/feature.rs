//! Per-document feature controller.
//!
//! Owns every video binding, discovers videos as the document mutates,
//! decides which video keyboard commands target, runs the hold-to-activate
//! machines and fans settings changes out to every overlay.

use tracing::{debug, info, warn};

use crate::constants::{approx_eq, constants};
use crate::hold::{HoldKind, HoldMachine, HoldState, Release};
use crate::host::{
  ActivationKind, Disposition, Host, HostEvent, KeyEvent, ListenerId, ListenerKind, MutationRecord, NodeId, PointerEvent,
  PointerPhase, TimerId, TimerTask, collect_videos,
};
use crate::overlay::{Overlay, OverlayOptions};
use crate::playback::PlaybackController;
use crate::settings::{OverlayPosition, Settings, SettingsPatch};
use crate::store::SettingsStore;

/// One bound video: its controller and the activation listeners that make
/// it the keyboard target.
struct VideoBinding {
  video: NodeId,
  controller: PlaybackController,
  listeners: Vec<ListenerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
  Reset,
  Decrease,
  Increase,
  CycleStep,
  ToggleOverlay,
  Hold(HoldKind),
}

pub struct FeatureController {
  settings: Settings,
  store: Box<dyn SettingsStore>,
  bindings: Vec<VideoBinding>,
  active_video: Option<NodeId>,
  overlay_visible: bool,
  preferred_speed: f64,
  last_custom_speed: f64,
  overlay_position: OverlayPosition,
  fast_forward: HoldMachine,
  slow_motion: HoldMachine,
  document_listeners: Vec<ListenerId>,
  initialized: bool,
}

impl FeatureController {
  pub fn new(settings: Settings, store: Box<dyn SettingsStore>) -> Self {
    let settings = settings.normalized();
    Self {
      overlay_visible: settings.show_current_speed,
      preferred_speed: settings.prefer_speed,
      last_custom_speed: settings.prefer_speed,
      overlay_position: settings.overlay_position,
      settings,
      store,
      bindings: Vec::new(),
      active_video: None,
      fast_forward: HoldMachine::new(),
      slow_motion: HoldMachine::new(),
      document_listeners: Vec::new(),
      initialized: false,
    }
  }

  // --- Accessors ---

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn store(&self) -> &dyn SettingsStore {
    self.store.as_ref()
  }

  pub fn store_mut(&mut self) -> &mut dyn SettingsStore {
    self.store.as_mut()
  }

  pub fn bound_videos(&self) -> Vec<NodeId> {
    self.bindings.iter().map(|b| b.video).collect()
  }

  pub fn is_bound(&self, video: NodeId) -> bool {
    self.bindings.iter().any(|b| b.video == video)
  }

  pub fn active_video(&self) -> Option<NodeId> {
    self.active_video
  }

  pub fn last_custom_speed(&self) -> f64 {
    self.last_custom_speed
  }

  pub fn overlay_position(&self) -> OverlayPosition {
    self.overlay_position
  }

  pub fn overlay(&self, video: NodeId) -> Option<&Overlay> {
    self.binding(video).map(|b| b.controller.overlay())
  }

  pub fn hold_state(&self, kind: HoldKind) -> HoldState {
    self.hold(kind).state()
  }

  fn hold(&self, kind: HoldKind) -> &HoldMachine {
    match kind {
      HoldKind::FastForward => &self.fast_forward,
      HoldKind::SlowMotion => &self.slow_motion,
    }
  }

  fn hold_mut(&mut self, kind: HoldKind) -> &mut HoldMachine {
    match kind {
      HoldKind::FastForward => &mut self.fast_forward,
      HoldKind::SlowMotion => &mut self.slow_motion,
    }
  }

  fn binding(&self, video: NodeId) -> Option<&VideoBinding> {
    self.bindings.iter().find(|b| b.video == video)
  }

  fn binding_mut(&mut self, video: NodeId) -> Option<&mut VideoBinding> {
    self.bindings.iter_mut().find(|b| b.video == video)
  }

  // --- Lifecycle ---

  /// Bind every video already in the document, then start observing
  /// mutations and listening for keys.
  pub fn init(&mut self, host: &mut impl Host) {
    if self.initialized {
      return;
    }
    self.initialized = true;

    let document = host.document();
    for video in collect_videos(&*host, document) {
      self.bind(host, video);
    }
    host.observe_mutations(document);
    self.document_listeners =
      vec![host.listen(document, ListenerKind::KeyDown), host.listen(document, ListenerKind::KeyUp)];
    info!(videos = self.bindings.len(), "feature: initialized");
  }

  /// Tear everything down: listeners, observer, hold timers and bindings.
  pub fn dispose(&mut self, host: &mut impl Host) {
    if !self.initialized {
      return;
    }
    self.initialized = false;

    for id in self.document_listeners.drain(..) {
      host.unlisten(id);
    }
    host.disconnect_mutations();
    for kind in [HoldKind::FastForward, HoldKind::SlowMotion] {
      if let Some(timer) = self.hold_mut(kind).cancel() {
        host.clear_timeout(timer);
      }
    }
    for mut binding in self.bindings.drain(..) {
      for id in binding.listeners.drain(..) {
        host.unlisten(id);
      }
      binding.controller.destroy(host);
    }
    self.active_video = None;
    info!("feature: disposed");
  }

  // --- Settings ---

  /// Swap in a new snapshot and push it to every bound controller. Holds
  /// in flight are left alone.
  pub fn update_settings(&mut self, host: &mut impl Host, next: Settings) {
    self.settings = next.normalized();
    self.overlay_visible = self.settings.show_current_speed;
    self.overlay_position = self.settings.overlay_position;

    if !approx_eq(self.preferred_speed, self.settings.prefer_speed, constants().speed_tolerance) {
      self.preferred_speed = self.settings.prefer_speed;
      self.last_custom_speed = self.settings.prefer_speed;
    }

    let visible = self.overlay_visible;
    let font_size = self.settings.overlay_font_size;
    let alpha = self.settings.overlay_background_alpha;
    let position = self.overlay_position;
    let step = self.settings.current_step();
    for binding in self.bindings.iter_mut() {
      let controller = &mut binding.controller;
      controller.set_overlay_visibility(host, visible);
      controller.set_overlay_appearance(host, font_size, alpha);
      controller.set_overlay_position(host, position);
      controller.set_rewind_advance_step(host, step);
    }
    debug!(bindings = self.bindings.len(), "feature: settings applied");
  }

  fn persist(&mut self, patch: SettingsPatch) {
    if let Err(e) = self.store.set(&patch) {
      warn!(err = %e, "feature: failed to persist settings");
    }
  }

  // --- Bindings ---

  fn overlay_options(&self) -> OverlayOptions {
    OverlayOptions {
      visible: self.overlay_visible,
      font_size: self.settings.overlay_font_size,
      background_alpha: self.settings.overlay_background_alpha,
      position: self.overlay_position,
      step_seconds: Some(self.settings.current_step()),
    }
  }

  fn bind(&mut self, host: &mut impl Host, video: NodeId) {
    if let Some(binding) = self.bindings.iter_mut().find(|b| b.video == video) {
      binding.controller.overlay_mut().reanchor(host);
      return;
    }

    let mut controller = PlaybackController::new(host, video, self.overlay_options());
    let mut kinds = ActivationKind::ALWAYS.to_vec();
    if host.supports_picture_in_picture() {
      kinds.extend(ActivationKind::PICTURE_IN_PICTURE);
    }
    let listeners = kinds.into_iter().map(|kind| host.listen(video, ListenerKind::Activation(kind))).collect();
    let rate = controller.handle_rate_change(host);

    self.bindings.push(VideoBinding { video, controller, listeners });
    if self.active_video.is_none() {
      self.active_video = Some(video);
    }
    self.fold_rate_change(rate);
    info!(video = ?video, total = self.bindings.len(), "feature: bound video");
  }

  fn unbind(&mut self, host: &mut impl Host, video: NodeId) {
    let Some(index) = self.bindings.iter().position(|b| b.video == video) else {
      return;
    };
    let mut binding = self.bindings.remove(index);

    for kind in [HoldKind::FastForward, HoldKind::SlowMotion] {
      let machine = self.hold_mut(kind);
      let was_held = !machine.is_idle();
      if let Some(timer) = machine.cancel_for(video) {
        host.clear_timeout(timer);
      }
      if was_held && self.hold(kind).is_idle() {
        debug!(video = ?video, hold = kind.label(), "feature: cancelled hold for removed video");
      }
    }

    for id in binding.listeners.drain(..) {
      host.unlisten(id);
    }
    binding.controller.destroy(host);

    if self.active_video == Some(video) {
      self.active_video = self.bindings.first().map(|b| b.video);
    }
    info!(video = ?video, total = self.bindings.len(), "feature: unbound video");
  }

  fn handle_mutations(&mut self, host: &mut impl Host, records: Vec<MutationRecord>) {
    for record in records {
      for node in record.added {
        if !host.is_connected(node) {
          continue;
        }
        for video in collect_videos(&*host, node) {
          self.bind(host, video);
        }
      }
      for node in record.removed {
        // Re-parented, not removed.
        if host.is_connected(node) {
          continue;
        }
        for video in collect_videos(&*host, node) {
          self.unbind(host, video);
        }
      }
    }
  }

  // --- Active video ---

  fn set_active_video(&mut self, video: NodeId) {
    if self.is_bound(video) {
      self.active_video = Some(video);
    }
  }

  /// Explicitly activated video if still bound, else the first playing
  /// one, else any bound video.
  pub fn primary_video(&self, host: &impl Host) -> Option<NodeId> {
    if let Some(active) = self.active_video.filter(|v| self.is_bound(*v)) {
      return Some(active);
    }
    self
      .bindings
      .iter()
      .find(|b| !host.paused(b.video))
      .or_else(|| self.bindings.first())
      .map(|b| b.video)
  }

  // --- Events ---

  pub fn handle_event(&mut self, host: &mut impl Host, event: HostEvent) -> Disposition {
    match event {
      HostEvent::Mutations(records) => {
        self.handle_mutations(host, records);
        Disposition::Ignored
      }
      HostEvent::KeyDown(event) => self.handle_key_down(host, &event),
      HostEvent::KeyUp(event) => self.handle_key_up(host, &event),
      HostEvent::Activation { video, kind } => {
        debug!(video = ?video, kind = ?kind, "feature: activation");
        self.set_active_video(video);
        Disposition::Ignored
      }
      HostEvent::RateChange { video } => {
        if let Some(binding) = self.binding_mut(video) {
          let rate = binding.controller.handle_rate_change(host);
          self.fold_rate_change(rate);
        }
        Disposition::Ignored
      }
      HostEvent::Pointer { overlay, phase, event } => self.handle_pointer(host, overlay, phase, event),
      HostEvent::OverlayClick { overlay } => self
        .bindings
        .iter()
        .find(|b| b.controller.overlay().element() == overlay)
        .map_or(Disposition::Ignored, |b| b.controller.overlay().click()),
      HostEvent::ViewportResize | HostEvent::FullscreenChange => {
        for binding in self.bindings.iter_mut() {
          binding.controller.overlay_mut().apply_position(host);
        }
        Disposition::Ignored
      }
      HostEvent::VideoResize { video } => {
        if let Some(binding) = self.binding_mut(video) {
          binding.controller.overlay_mut().apply_position(host);
        }
        Disposition::Ignored
      }
      HostEvent::Timer { id, task } => {
        self.handle_timer(host, id, task);
        Disposition::Ignored
      }
    }
  }

  fn handle_pointer(
    &mut self,
    host: &mut impl Host,
    overlay: NodeId,
    phase: PointerPhase,
    event: PointerEvent,
  ) -> Disposition {
    let Some(binding) = self.bindings.iter_mut().find(|b| b.controller.overlay().element() == overlay) else {
      return Disposition::Ignored;
    };
    let overlay = binding.controller.overlay_mut();
    match phase {
      PointerPhase::Down => overlay.pointer_down(host, event),
      PointerPhase::Move => overlay.pointer_move(host, event),
      PointerPhase::Up | PointerPhase::Cancel => {
        let (disposition, position) = overlay.pointer_up(host);
        if let Some(position) = position {
          self.handle_overlay_position_change(position);
        }
        disposition
      }
    }
  }

  fn handle_timer(&mut self, host: &mut impl Host, id: TimerId, task: TimerTask) {
    match task {
      TimerTask::HoldActivate(kind) => self.activate_hold(host, kind, id),
      TimerTask::HideOverlay { video } => {
        if let Some(binding) = self.binding_mut(video) {
          binding.controller.overlay_mut().handle_timer(host, id);
        }
      }
    }
  }

  // --- Keyboard ---

  fn command_for(&self, key: &str) -> Option<Command> {
    let s = &self.settings;
    if key == s.reset_key {
      Some(Command::Reset)
    } else if key == s.decrease_key {
      Some(Command::Decrease)
    } else if key == s.increase_key {
      Some(Command::Increase)
    } else if key == s.cycle_step_key {
      Some(Command::CycleStep)
    } else if key == s.rewind_key {
      Some(Command::Hold(HoldKind::SlowMotion))
    } else if key == s.advance_key {
      Some(Command::Hold(HoldKind::FastForward))
    } else if key == s.toggle_overlay_key {
      Some(Command::ToggleOverlay)
    } else {
      None
    }
  }

  fn handle_key_down(&mut self, host: &mut impl Host, event: &KeyEvent) -> Disposition {
    if event.default_prevented || event.repeat || event.has_modifier() {
      return Disposition::Ignored;
    }
    if event.target.is_some_and(|target| host.is_editable(target)) {
      return Disposition::Ignored;
    }
    let Some(command) = self.command_for(&event.key.to_lowercase()) else {
      return Disposition::Ignored;
    };
    let Some(video) = self.primary_video(&*host) else {
      return Disposition::Ignored;
    };

    debug!(key = %event.key, command = ?command, video = ?video, "feature: key command");
    match command {
      Command::Reset => self.reset_speed(host, video),
      Command::Decrease => self.adjust_speed(host, video, -self.settings.speed_step),
      Command::Increase => self.adjust_speed(host, video, self.settings.speed_step),
      Command::CycleStep => self.cycle_step(host, video),
      Command::ToggleOverlay => self.toggle_overlay(host),
      Command::Hold(kind) => self.begin_hold(host, kind, video),
    }
    Disposition::Consumed
  }

  fn handle_key_up(&mut self, host: &mut impl Host, event: &KeyEvent) -> Disposition {
    let kind = match self.command_for(&event.key.to_lowercase()) {
      Some(Command::Hold(kind)) => kind,
      _ => return Disposition::Ignored,
    };
    match self.hold_mut(kind).release() {
      Release::Nothing => Disposition::Ignored,
      Release::Tap { timer, tap } => {
        host.clear_timeout(timer);
        if let Some(binding) = self.binding_mut(tap.video) {
          match kind {
            HoldKind::FastForward => binding.controller.advance(host, tap.seconds),
            HoldKind::SlowMotion => binding.controller.rewind(host, tap.seconds),
          }
        }
        Disposition::Consumed
      }
      Release::Restore { video, rate } => {
        if let Some(binding) = self.binding_mut(video) {
          let applied = binding.controller.set_speed(host, rate);
          binding.controller.flash_overlay(host, constants().flash_duration());
          self.record_custom_speed(applied);
        }
        info!(video = ?video, hold = kind.label(), rate, "feature: hold released");
        Disposition::Consumed
      }
    }
  }

  fn reset_speed(&mut self, host: &mut impl Host, video: NodeId) {
    let tolerance = constants().speed_tolerance;
    let target = self.custom_speed_target();
    let Some(binding) = self.binding_mut(video) else {
      return;
    };
    let current = binding.controller.rate(&*host);
    let (remember, next) = if approx_eq(current, 1.0, tolerance) { (target, target) } else { (current, 1.0) };
    binding.controller.set_speed(host, next);
    binding.controller.flash_overlay(host, constants().flash_duration());
    self.record_custom_speed(remember);
  }

  fn adjust_speed(&mut self, host: &mut impl Host, video: NodeId, delta: f64) {
    let Some(binding) = self.binding_mut(video) else {
      return;
    };
    let rate = binding.controller.change_speed(host, delta);
    binding.controller.flash_overlay(host, constants().flash_duration());
    self.record_custom_speed(rate);
  }

  fn cycle_step(&mut self, host: &mut impl Host, video: NodeId) {
    let next = self.settings.next_step();
    let patch = SettingsPatch { rewind_advance_current_step: Some(next), ..Default::default() };
    self.settings = self.settings.merged(&patch);
    let step = self.settings.current_step();
    for binding in self.bindings.iter_mut() {
      binding.controller.set_rewind_advance_step(host, step);
    }
    if let Some(binding) = self.binding_mut(video) {
      binding.controller.flash_overlay(host, constants().flash_duration());
    }
    info!(step, "feature: rewind/advance step changed");
    self.persist(patch);
  }

  fn toggle_overlay(&mut self, host: &mut impl Host) {
    self.overlay_visible = !self.overlay_visible;
    let visible = self.overlay_visible;
    for binding in self.bindings.iter_mut() {
      binding.controller.set_overlay_visibility(host, visible);
    }
    self.persist(SettingsPatch { show_current_speed: Some(visible), ..Default::default() });
  }

  // --- Hold-to-activate ---

  fn begin_hold(&mut self, host: &mut impl Host, kind: HoldKind, video: NodeId) {
    let Some(pre_rate) = self.binding(video).map(|b| b.controller.rate(&*host)) else {
      return;
    };
    let seconds = self.settings.current_step();
    let machine = match kind {
      HoldKind::FastForward => &mut self.fast_forward,
      HoldKind::SlowMotion => &mut self.slow_motion,
    };
    let accepted =
      machine.press(video, pre_rate, seconds, || host.set_timeout(constants().hold_delay(), TimerTask::HoldActivate(kind)));
    if accepted {
      debug!(video = ?video, hold = kind.label(), pre_rate, "feature: hold scheduled");
    }
  }

  fn activate_hold(&mut self, host: &mut impl Host, kind: HoldKind, id: TimerId) {
    let target = kind.target_rate(self.settings.fast_forward_speed, self.settings.slow_motion_speed);
    let Some(video) = self.hold_mut(kind).fire(id, target) else {
      return;
    };
    let Some(binding) = self.binding_mut(video) else {
      self.hold_mut(kind).cancel();
      return;
    };
    let applied = binding.controller.set_speed(host, target);
    binding.controller.flash_overlay(host, constants().flash_duration());
    self.hold_mut(kind).set_applied_target(applied);
    info!(video = ?video, hold = kind.label(), rate = applied, "feature: hold active");
  }

  // --- Custom speed bookkeeping ---

  /// Fold an observed rate into "last custom speed", unless it is the
  /// active hold's own rate write.
  fn fold_rate_change(&mut self, rate: f64) {
    if self.fast_forward.is_own_rate(rate) || self.slow_motion.is_own_rate(rate) {
      return;
    }
    self.record_custom_speed(rate);
  }

  fn record_custom_speed(&mut self, rate: f64) {
    if !rate.is_finite() || approx_eq(rate, 1.0, constants().speed_tolerance) {
      return;
    }
    self.last_custom_speed = rate;
  }

  fn custom_speed_target(&self) -> f64 {
    let tolerance = constants().speed_tolerance;
    if self.last_custom_speed.is_finite() && !approx_eq(self.last_custom_speed, 1.0, tolerance) {
      self.last_custom_speed
    } else if self.preferred_speed.is_finite() && !approx_eq(self.preferred_speed, 1.0, tolerance) {
      self.preferred_speed
    } else {
      1.0
    }
  }

  // --- Overlay position ---

  fn handle_overlay_position_change(&mut self, position: OverlayPosition) {
    let next = OverlayPosition {
      x: round_pixels(position.x),
      y: round_pixels(position.y),
      ratio_x: position.ratio_x.and_then(round_ratio),
      ratio_y: position.ratio_y.and_then(round_ratio),
    };
    let c = constants();
    let current = self.overlay_position;
    let unchanged = approx_eq(next.x, current.x, c.position_px_tolerance)
      && approx_eq(next.y, current.y, c.position_px_tolerance)
      && approx_eq(next.ratio_x.unwrap_or(0.0), current.ratio_x.unwrap_or(0.0), c.position_ratio_tolerance)
      && approx_eq(next.ratio_y.unwrap_or(0.0), current.ratio_y.unwrap_or(0.0), c.position_ratio_tolerance);
    if unchanged {
      return;
    }
    self.overlay_position = next;
    info!(x = next.x, y = next.y, "feature: overlay moved");
    self.persist(SettingsPatch { overlay_position: Some(next), ..Default::default() });
  }
}

fn round_pixels(value: f64) -> f64 {
  if !value.is_finite() {
    return 0.0;
  }
  ((value * 10.0).round() / 10.0).max(0.0)
}

fn round_ratio(value: f64) -> Option<f64> {
  value.is_finite().then(|| ((value * 1000.0).round() / 1000.0).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
  use super::*;
  use anyhow::{Result, anyhow};
  use std::time::Duration;

  use crate::geometry::Rect;
  use crate::host::Dom;
  use crate::sim::{SimDocument, VideoSpec};
  use crate::store::{Listener, MemoryStore, SubscriptionId};

  fn page(count: usize) -> (SimDocument, Vec<NodeId>) {
    let mut doc = SimDocument::new();
    let root = doc.document();
    let videos = (0..count)
      .map(|i| {
        let top = i as f64 * 400.0;
        let container = doc.create_element("div");
        doc.set_rect(container, Rect::new(0.0, top, 640.0, 360.0));
        doc.append(root, container);
        let video = doc.create_video(VideoSpec { top, current_time: 30.0, ..Default::default() });
        doc.append(container, video);
        video
      })
      .collect();
    (doc, videos)
  }

  fn started_with(doc: &mut SimDocument, settings: Settings) -> FeatureController {
    let mut feature = FeatureController::new(settings.clone(), Box::new(MemoryStore::new(settings)));
    feature.init(doc);
    feature
  }

  fn started(doc: &mut SimDocument) -> FeatureController {
    started_with(doc, Settings::default())
  }

  fn key_down(doc: &mut SimDocument, feature: &mut FeatureController, event: KeyEvent) -> Disposition {
    doc.key_down(event);
    doc.settle(feature).first().copied().unwrap_or(Disposition::Ignored)
  }

  fn press(doc: &mut SimDocument, feature: &mut FeatureController, key: &str) -> Disposition {
    key_down(doc, feature, KeyEvent::new(key))
  }

  fn release(doc: &mut SimDocument, feature: &mut FeatureController, key: &str) -> Disposition {
    doc.key_up(KeyEvent::new(key));
    doc.settle(feature).first().copied().unwrap_or(Disposition::Ignored)
  }

  fn past_hold_delay() -> Duration {
    constants().hold_delay() + Duration::from_millis(10)
  }

  fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
  }

  struct FailingStore(Settings);

  impl SettingsStore for FailingStore {
    fn get(&self) -> Settings {
      self.0.clone()
    }

    fn set(&mut self, _patch: &SettingsPatch) -> Result<Settings> {
      Err(anyhow!("storage unavailable"))
    }

    fn subscribe(&mut self, _listener: Listener) -> SubscriptionId {
      0
    }

    fn unsubscribe(&mut self, _id: SubscriptionId) {}
  }

  // --- Discovery ---

  #[test]
  fn init_binds_existing_videos_and_activates_the_first() {
    let (mut doc, videos) = page(2);
    let mut feature = started(&mut doc);
    assert_eq!(feature.bound_videos(), videos);
    assert_eq!(feature.active_video(), Some(videos[0]));

    let listeners = doc.listener_count();
    feature.init(&mut doc);
    assert_eq!(doc.listener_count(), listeners);
    assert_eq!(feature.bound_videos().len(), 2);
  }

  #[test]
  fn discovers_videos_added_later_inside_shadow_roots() {
    let (mut doc, _) = page(0);
    let mut feature = started(&mut doc);
    assert!(feature.bound_videos().is_empty());

    let shell = doc.create_element("player-shell");
    let shadow = doc.attach_shadow(shell);
    let video = doc.create_video(VideoSpec::default());
    doc.append(shadow, video);
    let root = doc.document();
    doc.append(root, shell);
    doc.settle(&mut feature);

    assert!(feature.is_bound(video));
    assert_eq!(feature.active_video(), Some(video));
    assert_eq!(doc.overlays_under(shell).len(), 1);

    doc.remove(shell);
    doc.settle(&mut feature);
    assert!(!feature.is_bound(video));
    assert_eq!(feature.active_video(), None);
  }

  #[test]
  fn removing_the_active_video_falls_back_to_the_first_remaining() {
    let (mut doc, videos) = page(3);
    let mut feature = started(&mut doc);
    doc.activate(videos[2], ActivationKind::Click);
    doc.settle(&mut feature);
    assert_eq!(feature.active_video(), Some(videos[2]));

    doc.remove(videos[2]);
    doc.settle(&mut feature);
    assert_eq!(feature.active_video(), Some(videos[0]));
  }

  #[test]
  fn dispose_releases_every_host_resource() {
    let (mut doc, videos) = page(2);
    let mut feature = started(&mut doc);
    press(&mut doc, &mut feature, "x");
    feature.dispose(&mut doc);

    assert_eq!(doc.listener_count(), 0);
    assert_eq!(doc.pending_timers(), 0);
    assert!(!doc.is_observing());
    for video in videos {
      assert!(doc.overlays_under(doc.parent_element(video).unwrap()).is_empty());
    }
    assert!(feature.bound_videos().is_empty());
  }

  // --- Keyboard ---

  #[test]
  fn speed_keys_target_only_the_focused_video() {
    let (mut doc, videos) = page(2);
    let mut feature = started(&mut doc);
    doc.activate(videos[1], ActivationKind::Click);
    doc.settle(&mut feature);

    assert!(press(&mut doc, &mut feature, "d").is_consumed());
    assert!(close(doc.media(videos[1]).rate, 1.1));
    assert_eq!(doc.media(videos[0]).rate, 1.0);
    assert!(doc.media(videos[0]).rate_writes.is_empty());

    assert!(press(&mut doc, &mut feature, "s").is_consumed());
    assert!(close(doc.media(videos[1]).rate, 1.0));
  }

  #[test]
  fn keys_are_matched_case_insensitively() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);
    assert!(press(&mut doc, &mut feature, "D").is_consumed());
    assert!(close(doc.media(videos[0]).rate, 1.1));
  }

  #[test]
  fn filtered_key_events_pass_through() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);
    let input = doc.create_element("input");
    doc.set_editable(input, true);

    let events = [
      KeyEvent { ctrl: true, ..KeyEvent::new("d") },
      KeyEvent { alt: true, ..KeyEvent::new("d") },
      KeyEvent { meta: true, ..KeyEvent::new("d") },
      KeyEvent { repeat: true, ..KeyEvent::new("d") },
      KeyEvent { default_prevented: true, ..KeyEvent::new("d") },
      KeyEvent { target: Some(input), ..KeyEvent::new("d") },
      KeyEvent::new("q"),
    ];
    for event in events {
      assert_eq!(key_down(&mut doc, &mut feature, event), Disposition::Ignored);
    }
    assert!(doc.media(videos[0]).rate_writes.is_empty());
  }

  #[test]
  fn keys_pass_through_without_videos() {
    let (mut doc, _) = page(0);
    let mut feature = started(&mut doc);
    assert_eq!(press(&mut doc, &mut feature, "d"), Disposition::Ignored);
    assert_eq!(press(&mut doc, &mut feature, "x"), Disposition::Ignored);
    assert_eq!(doc.pending_timers(), 0);
  }

  #[test]
  fn reset_toggles_between_normal_and_last_custom_speed() {
    let (mut doc, videos) = page(1);
    let video = videos[0];
    let mut feature = started(&mut doc);

    press(&mut doc, &mut feature, "a");
    assert!(close(doc.media(video).rate, 1.3));

    press(&mut doc, &mut feature, "a");
    assert_eq!(doc.media(video).rate, 1.0);

    press(&mut doc, &mut feature, "d");
    press(&mut doc, &mut feature, "d");
    assert!(close(feature.last_custom_speed(), 1.2));
    press(&mut doc, &mut feature, "a");
    assert_eq!(doc.media(video).rate, 1.0);
    press(&mut doc, &mut feature, "a");
    assert!(close(doc.media(video).rate, 1.2));
  }

  #[test]
  fn cycling_the_step_wraps_and_persists() {
    let (mut doc, videos) = page(2);
    let mut feature = started(&mut doc);
    assert_eq!(feature.settings().rewind_advance_current_step, 10.0);

    assert!(press(&mut doc, &mut feature, "e").is_consumed());
    assert_eq!(feature.settings().rewind_advance_current_step, 2.0);
    assert_eq!(feature.store().get().rewind_advance_current_step, 2.0);
    for video in &videos {
      assert_eq!(feature.overlay(*video).unwrap().label(), "1.0×/2");
    }

    press(&mut doc, &mut feature, "e");
    assert_eq!(feature.settings().rewind_advance_current_step, 5.0);
  }

  #[test]
  fn toggling_the_overlay_persists_visibility() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);
    let element = feature.overlay(videos[0]).unwrap().element();
    assert!(doc.overlay_view(element).unwrap().visible);

    assert!(press(&mut doc, &mut feature, "v").is_consumed());
    assert!(!doc.overlay_view(element).unwrap().visible);
    assert!(!feature.store().get().show_current_speed);

    press(&mut doc, &mut feature, "v");
    assert!(doc.overlay_view(element).unwrap().visible);
    assert!(feature.store().get().show_current_speed);
  }

  #[test]
  fn persistence_failure_keeps_in_memory_state() {
    let (mut doc, _) = page(1);
    let settings = Settings::default();
    let mut feature = FeatureController::new(settings.clone(), Box::new(FailingStore(settings)));
    feature.init(&mut doc);

    press(&mut doc, &mut feature, "e");
    assert_eq!(feature.settings().rewind_advance_current_step, 2.0);
    press(&mut doc, &mut feature, "e");
    assert_eq!(feature.settings().rewind_advance_current_step, 5.0);
  }

  // --- Hold-to-activate ---

  #[test]
  fn tapping_advance_seeks_once_without_touching_the_rate() {
    let (mut doc, videos) = page(1);
    let video = videos[0];
    let mut feature = started(&mut doc);

    assert!(press(&mut doc, &mut feature, "x").is_consumed());
    doc.run_for(&mut feature, Duration::from_millis(100));
    assert!(release(&mut doc, &mut feature, "x").is_consumed());

    assert_eq!(doc.media(video).seeks, vec![40.0]);
    assert!(doc.media(video).rate_writes.is_empty());
    assert_eq!(feature.hold_state(HoldKind::FastForward), HoldState::Idle);
  }

  #[test]
  fn tapping_rewind_seeks_back_by_the_current_step() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);
    press(&mut doc, &mut feature, "e");

    press(&mut doc, &mut feature, "z");
    release(&mut doc, &mut feature, "z");
    assert_eq!(doc.media(videos[0]).seeks, vec![28.0]);
  }

  #[test]
  fn holding_advance_fast_forwards_then_restores() {
    let (mut doc, videos) = page(1);
    let video = videos[0];
    let mut feature = started(&mut doc);

    press(&mut doc, &mut feature, "x");
    doc.run_for(&mut feature, past_hold_delay());
    assert_eq!(doc.media(video).rate, 2.0);
    assert!(matches!(feature.hold_state(HoldKind::FastForward), HoldState::Active { .. }));

    assert!(release(&mut doc, &mut feature, "x").is_consumed());
    assert_eq!(doc.media(video).rate, 1.0);
    assert_eq!(doc.media(video).rate_writes, vec![2.0, 1.0]);
    assert!(doc.media(video).seeks.is_empty());
    assert!(close(feature.last_custom_speed(), 1.3));
  }

  #[test]
  fn holding_rewind_plays_in_slow_motion() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);

    press(&mut doc, &mut feature, "z");
    doc.run_for(&mut feature, past_hold_delay());
    assert_eq!(doc.media(videos[0]).rate, 0.5);
    release(&mut doc, &mut feature, "z");
    assert_eq!(doc.media(videos[0]).rate, 1.0);
  }

  #[test]
  fn hold_restores_the_exact_pre_hold_rate() {
    let (mut doc, videos) = page(1);
    let video = videos[0];
    let mut feature = started(&mut doc);
    doc.set_rate_externally(video, 1.7);
    doc.settle(&mut feature);
    assert!(close(feature.last_custom_speed(), 1.7));

    press(&mut doc, &mut feature, "x");
    doc.run_for(&mut feature, past_hold_delay());
    release(&mut doc, &mut feature, "x");
    assert_eq!(doc.media(video).rate, 1.7);
    assert!(close(feature.last_custom_speed(), 1.7));
  }

  #[test]
  fn second_press_during_a_hold_is_ignored() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);

    press(&mut doc, &mut feature, "x");
    let timers = doc.pending_timers();
    press(&mut doc, &mut feature, "x");
    assert_eq!(doc.pending_timers(), timers);

    doc.run_for(&mut feature, past_hold_delay());
    release(&mut doc, &mut feature, "x");
    assert_eq!(doc.media(videos[0]).rate_writes, vec![2.0, 1.0]);
  }

  #[test]
  fn removing_a_video_mid_hold_drops_the_hold() {
    let (mut doc, videos) = page(2);
    let video = videos[0];
    let mut feature = started(&mut doc);

    press(&mut doc, &mut feature, "x");
    doc.run_for(&mut feature, past_hold_delay());
    assert_eq!(doc.media(video).rate, 2.0);

    doc.remove(video);
    doc.settle(&mut feature);
    assert_eq!(feature.hold_state(HoldKind::FastForward), HoldState::Idle);

    assert_eq!(release(&mut doc, &mut feature, "x"), Disposition::Ignored);
    assert_eq!(doc.media(video).rate_writes, vec![2.0]);
    assert!(doc.media(videos[1]).rate_writes.is_empty());
  }

  #[test]
  fn removing_a_video_before_activation_cancels_the_timer() {
    let (mut doc, videos) = page(1);
    let video = videos[0];
    let mut feature = started(&mut doc);

    press(&mut doc, &mut feature, "x");
    doc.remove(video);
    doc.settle(&mut feature);
    doc.run_for(&mut feature, Duration::from_secs(2));

    assert_eq!(doc.pending_timers(), 0);
    assert!(doc.media(video).rate_writes.is_empty());
    assert_eq!(release(&mut doc, &mut feature, "x"), Disposition::Ignored);
  }

  fn move_to_new_container(doc: &mut SimDocument, video: NodeId) -> NodeId {
    let container = doc.create_element("section");
    doc.set_rect(container, Rect::new(0.0, 800.0, 640.0, 360.0));
    let root = doc.document();
    doc.append(root, container);
    doc.append(container, video);
    container
  }

  #[test]
  fn moving_a_video_mid_hold_keeps_the_hold() {
    let (mut doc, videos) = page(2);
    let video = videos[0];
    let mut feature = started(&mut doc);
    let old_container = doc.parent_element(video).unwrap();

    press(&mut doc, &mut feature, "x");
    doc.run_for(&mut feature, past_hold_delay());
    assert_eq!(doc.media(video).rate, 2.0);

    let new_container = move_to_new_container(&mut doc, video);
    doc.settle(&mut feature);
    assert!(feature.is_bound(video));
    assert!(matches!(feature.hold_state(HoldKind::FastForward), HoldState::Active { .. }));
    assert!(doc.overlays_under(old_container).is_empty());
    assert_eq!(doc.overlays_under(new_container).len(), 1);

    assert!(release(&mut doc, &mut feature, "x").is_consumed());
    assert_eq!(doc.media(video).rate, 1.0);
    assert_eq!(doc.media(video).rate_writes, vec![2.0, 1.0]);
  }

  #[test]
  fn moving_the_active_video_keeps_it_active() {
    let (mut doc, videos) = page(2);
    let mut feature = started(&mut doc);
    doc.activate(videos[1], ActivationKind::Click);
    doc.settle(&mut feature);

    move_to_new_container(&mut doc, videos[1]);
    doc.settle(&mut feature);
    assert_eq!(feature.active_video(), Some(videos[1]));
    assert_eq!(feature.bound_videos().len(), 2);

    press(&mut doc, &mut feature, "d");
    assert!(close(doc.media(videos[1]).rate, 1.1));
    assert!(doc.media(videos[0]).rate_writes.is_empty());
  }

  // --- Settings and overlays ---

  #[test]
  fn settings_updates_reach_every_overlay() {
    let (mut doc, videos) = page(2);
    let mut feature = started(&mut doc);
    let next = Settings {
      overlay_font_size: 24.0,
      show_current_speed: false,
      rewind_advance_current_step: 5.0,
      ..Settings::default()
    };
    feature.update_settings(&mut doc, next);

    for video in videos {
      let element = feature.overlay(video).unwrap().element();
      let view = doc.overlay_view(element).unwrap();
      assert_eq!(view.font_size, 24.0);
      assert!(!view.visible);
      assert_eq!(view.text, "1.0×/5");
    }
  }

  #[test]
  fn changing_the_preferred_speed_resets_the_custom_speed() {
    let (mut doc, _) = page(1);
    let mut feature = started(&mut doc);
    press(&mut doc, &mut feature, "d");
    assert!(close(feature.last_custom_speed(), 1.1));

    feature.update_settings(&mut doc, Settings::default());
    assert!(close(feature.last_custom_speed(), 1.1));

    feature.update_settings(&mut doc, Settings { prefer_speed: 1.5, ..Settings::default() });
    assert_eq!(feature.last_custom_speed(), 1.5);
  }

  #[test]
  fn dragging_an_overlay_persists_its_position() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);
    let element = feature.overlay(videos[0]).unwrap().element();
    let start = feature.overlay(videos[0]).unwrap().position();

    doc.pointer(element, PointerPhase::Down, PointerEvent { x: 10.0, y: 10.0, ..Default::default() });
    assert_eq!(doc.settle(&mut feature), vec![Disposition::Consumed]);
    doc.pointer(element, PointerPhase::Move, PointerEvent { x: 110.0, y: 60.0, ..Default::default() });
    doc.settle(&mut feature);
    doc.pointer(element, PointerPhase::Up, PointerEvent { x: 110.0, y: 60.0, ..Default::default() });
    doc.settle(&mut feature);

    let stored = feature.store().get().overlay_position;
    assert!((stored.x - (start.x + 100.0)).abs() < 0.1);
    assert!((stored.y - (start.y + 50.0)).abs() < 0.1);
    assert_eq!(feature.overlay_position(), stored);
  }

  #[test]
  fn clicking_an_overlay_is_swallowed() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);
    let element = feature.overlay(videos[0]).unwrap().element();
    let before = feature.store().get();

    doc.pointer(element, PointerPhase::Down, PointerEvent::default());
    doc.pointer(element, PointerPhase::Up, PointerEvent::default());
    doc.settle(&mut feature);
    doc.click_overlay(element);
    assert_eq!(doc.settle(&mut feature), vec![Disposition::Consumed]);
    assert_eq!(feature.store().get(), before);
  }

  #[test]
  fn external_rate_changes_are_displayed_and_remembered() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);
    doc.set_rate_externally(videos[0], 1.8);
    doc.settle(&mut feature);
    assert_eq!(feature.overlay(videos[0]).unwrap().label(), "1.8×/10");
    assert!(close(feature.last_custom_speed(), 1.8));
  }

  #[test]
  fn video_resize_re_anchors_the_overlay() {
    let (mut doc, videos) = page(1);
    let mut feature = started(&mut doc);
    let before = feature.overlay(videos[0]).unwrap().position();

    doc.resize_video(videos[0], 1280.0, 720.0);
    doc.settle(&mut feature);
    let after = feature.overlay(videos[0]).unwrap().position();
    assert!((after.x - before.x * 2.0).abs() < 0.001);
  }

  #[test]
  fn missing_resize_observer_and_pip_degrade_quietly() {
    let mut doc = SimDocument::with_capabilities(false, false);
    let container = doc.create_element("div");
    doc.set_rect(container, Rect::new(0.0, 0.0, 640.0, 360.0));
    let root = doc.document();
    doc.append(root, container);
    let video = doc.create_video(VideoSpec::default());
    doc.append(container, video);
    let mut feature = started(&mut doc);

    assert!(feature.is_bound(video));
    assert!(!doc.has_listener(video, ListenerKind::VideoResize));
    for kind in ActivationKind::PICTURE_IN_PICTURE {
      assert!(!doc.has_listener(video, ListenerKind::Activation(kind)));
    }
    for kind in ActivationKind::ALWAYS {
      assert!(doc.has_listener(video, ListenerKind::Activation(kind)));
    }

    let before = feature.overlay(video).unwrap().position();
    doc.resize_video(video, 1280.0, 720.0);
    doc.settle(&mut feature);
    assert_eq!(feature.overlay(video).unwrap().position(), before);
  }
}
