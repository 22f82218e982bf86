//! In-memory host document driven by a virtual clock.
//!
//! `SimDocument` implements every host capability the feature needs. Nodes
//! live in an arena and keep their ids after removal. Input helpers queue
//! events only when something listens for them, mutations are batched the
//! way a mutation observer delivers them, and timers fire only when the
//! clock is advanced.

use anyhow::{Result, anyhow};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::feature::FeatureController;
use crate::geometry::{Rect, Size};
use crate::host::{
  ActivationKind, CssPosition, Disposition, Dom, Events, HostEvent, KeyEvent, ListenerId, ListenerKind, Media,
  MutationRecord, NodeId, NodeRef, OverlayView, PointerEvent, PointerPhase, Scheduler, TimerId, TimerTask,
};

/// Initial state of a simulated video element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSpec {
  pub width: f64,
  pub height: f64,
  pub left: f64,
  pub top: f64,
  pub duration: Option<f64>,
  pub current_time: f64,
  pub paused: bool,
  pub seekable: bool,
  pub rate: f64,
}

impl Default for VideoSpec {
  fn default() -> Self {
    Self {
      width: 640.0,
      height: 360.0,
      left: 0.0,
      top: 0.0,
      duration: Some(120.0),
      current_time: 0.0,
      paused: true,
      seekable: true,
      rate: 1.0,
    }
  }
}

/// Media state of a simulated video, with a log of every write.
#[derive(Debug, Clone, PartialEq)]
pub struct SimMedia {
  pub rate: f64,
  pub current_time: f64,
  pub duration: Option<f64>,
  pub paused: bool,
  pub seekable: bool,
  pub rate_writes: Vec<f64>,
  pub seeks: Vec<f64>,
}

static NO_MEDIA: SimMedia = SimMedia {
  rate: 1.0,
  current_time: 0.0,
  duration: None,
  paused: true,
  seekable: false,
  rate_writes: Vec::new(),
  seeks: Vec::new(),
};

#[derive(Debug, Clone, PartialEq)]
enum SimKind {
  Document,
  Element(String),
  ShadowRoot,
  Video,
  Overlay,
}

#[derive(Debug, Clone)]
struct SimNode {
  kind: SimKind,
  parent: Option<NodeId>,
  children: Vec<NodeId>,
  shadow_root: Option<NodeId>,
  shadow_host: Option<NodeId>,
  rect: Option<Rect>,
  computed_position: CssPosition,
  inline_position: Option<CssPosition>,
  editable: bool,
  media: Option<SimMedia>,
  view: Option<OverlayView>,
}

impl SimNode {
  fn new(kind: SimKind) -> Self {
    Self {
      kind,
      parent: None,
      children: Vec::new(),
      shadow_root: None,
      shadow_host: None,
      rect: None,
      computed_position: CssPosition::Static,
      inline_position: None,
      editable: false,
      media: None,
      view: None,
    }
  }
}

pub struct SimDocument {
  nodes: Vec<SimNode>,
  viewport: Size,
  listeners: BTreeMap<ListenerId, (NodeId, ListenerKind)>,
  next_listener: u64,
  timers: BTreeMap<TimerId, (Duration, TimerTask)>,
  next_timer: u64,
  now: Duration,
  observed_root: Option<NodeId>,
  pending_mutations: Vec<MutationRecord>,
  queue: VecDeque<HostEvent>,
  resize_observer: bool,
  picture_in_picture: bool,
  pointer_capture: Option<(NodeId, i32)>,
}

impl Default for SimDocument {
  fn default() -> Self {
    Self::new()
  }
}

impl SimDocument {
  pub fn new() -> Self {
    Self::with_capabilities(true, true)
  }

  /// A document whose host lacks resize observation and/or picture-in-picture.
  pub fn with_capabilities(resize_observer: bool, picture_in_picture: bool) -> Self {
    Self {
      nodes: vec![SimNode::new(SimKind::Document)],
      viewport: Size::new(1280.0, 720.0),
      listeners: BTreeMap::new(),
      next_listener: 0,
      timers: BTreeMap::new(),
      next_timer: 0,
      now: Duration::ZERO,
      observed_root: None,
      pending_mutations: Vec::new(),
      queue: VecDeque::new(),
      resize_observer,
      picture_in_picture,
      pointer_capture: None,
    }
  }

  fn get(&self, id: NodeId) -> Option<&SimNode> {
    self.nodes.get(id.0 as usize)
  }

  fn get_mut(&mut self, id: NodeId) -> Option<&mut SimNode> {
    self.nodes.get_mut(id.0 as usize)
  }

  fn push(&mut self, node: SimNode) -> NodeId {
    let id = NodeId(self.nodes.len() as u32);
    self.nodes.push(node);
    id
  }

  // --- Building ---

  pub fn create_element(&mut self, tag: &str) -> NodeId {
    self.push(SimNode::new(SimKind::Element(tag.to_string())))
  }

  pub fn create_video(&mut self, spec: VideoSpec) -> NodeId {
    let mut node = SimNode::new(SimKind::Video);
    node.rect = Some(Rect::new(spec.left, spec.top, spec.width, spec.height));
    node.media = Some(SimMedia {
      rate: spec.rate,
      current_time: spec.current_time,
      duration: spec.duration,
      paused: spec.paused,
      seekable: spec.seekable,
      rate_writes: Vec::new(),
      seeks: Vec::new(),
    });
    self.push(node)
  }

  /// Attach an open shadow root to `host` and return it.
  pub fn attach_shadow(&mut self, host: NodeId) -> NodeId {
    let mut root = SimNode::new(SimKind::ShadowRoot);
    root.shadow_host = Some(host);
    let root = self.push(root);
    if let Some(node) = self.get_mut(host) {
      node.shadow_root = Some(root);
    }
    root
  }

  pub fn append(&mut self, parent: NodeId, child: NodeId) {
    self.append_child(parent, child);
  }

  pub fn remove(&mut self, child: NodeId) {
    self.remove_child(child);
  }

  pub fn set_rect(&mut self, id: NodeId, rect: Rect) {
    if let Some(node) = self.get_mut(id) {
      node.rect = Some(rect);
    }
  }

  pub fn set_computed_position(&mut self, id: NodeId, position: CssPosition) {
    if let Some(node) = self.get_mut(id) {
      node.computed_position = position;
    }
  }

  pub fn set_editable(&mut self, id: NodeId, editable: bool) {
    if let Some(node) = self.get_mut(id) {
      node.editable = editable;
    }
  }

  fn in_observed_tree(&self, id: NodeId) -> bool {
    let Some(root) = self.observed_root else {
      return false;
    };
    let mut current = Some(id);
    while let Some(node) = current {
      if node == root {
        return true;
      }
      current = self.get(node).and_then(|n| n.parent);
    }
    false
  }

  // --- Inspection ---

  pub fn media(&self, video: NodeId) -> &SimMedia {
    self.get(video).and_then(|n| n.media.as_ref()).unwrap_or(&NO_MEDIA)
  }

  fn media_mut(&mut self, video: NodeId) -> Option<&mut SimMedia> {
    self.get_mut(video).and_then(|n| n.media.as_mut())
  }

  pub fn overlay_view(&self, element: NodeId) -> Option<&OverlayView> {
    self.get(element).and_then(|n| n.view.as_ref())
  }

  /// Overlay badges that are direct children of `parent`.
  pub fn overlays_under(&self, parent: NodeId) -> Vec<NodeId> {
    self
      .get(parent)
      .map(|n| n.children.iter().copied().filter(|c| self.get(*c).is_some_and(|c| c.kind == SimKind::Overlay)).collect())
      .unwrap_or_default()
  }

  pub fn has_listener(&self, target: NodeId, kind: ListenerKind) -> bool {
    self.listeners.values().any(|(t, k)| *t == target && *k == kind)
  }

  pub fn listener_count(&self) -> usize {
    self.listeners.len()
  }

  pub fn pending_timers(&self) -> usize {
    self.timers.len()
  }

  pub fn pointer_capture(&self) -> Option<(NodeId, i32)> {
    self.pointer_capture
  }

  pub fn is_observing(&self) -> bool {
    self.observed_root.is_some()
  }

  // --- Input ---

  fn queue_if(&mut self, target: NodeId, kind: ListenerKind, event: HostEvent) {
    if self.has_listener(target, kind) {
      self.queue.push_back(event);
    }
  }

  pub fn key_down(&mut self, event: KeyEvent) {
    let document = self.document();
    self.queue_if(document, ListenerKind::KeyDown, HostEvent::KeyDown(event));
  }

  pub fn key_up(&mut self, event: KeyEvent) {
    let document = self.document();
    self.queue_if(document, ListenerKind::KeyUp, HostEvent::KeyUp(event));
  }

  pub fn activate(&mut self, video: NodeId, kind: ActivationKind) {
    self.queue_if(video, ListenerKind::Activation(kind), HostEvent::Activation { video, kind });
  }

  pub fn play(&mut self, video: NodeId) {
    if let Some(media) = self.media_mut(video) {
      media.paused = false;
    }
    self.activate(video, ActivationKind::Play);
  }

  pub fn pause(&mut self, video: NodeId) {
    if let Some(media) = self.media_mut(video) {
      media.paused = true;
    }
  }

  /// Rate change made by the page itself, e.g. its own speed menu.
  pub fn set_rate_externally(&mut self, video: NodeId, rate: f64) {
    self.set_playback_rate(video, rate);
  }

  pub fn set_seekable(&mut self, video: NodeId, seekable: bool) {
    if let Some(media) = self.media_mut(video) {
      media.seekable = seekable;
    }
  }

  pub fn pointer(&mut self, overlay: NodeId, phase: PointerPhase, event: PointerEvent) {
    let kind = match phase {
      PointerPhase::Down => ListenerKind::PointerDown,
      PointerPhase::Move => ListenerKind::PointerMove,
      PointerPhase::Up => ListenerKind::PointerUp,
      PointerPhase::Cancel => ListenerKind::PointerCancel,
    };
    self.queue_if(overlay, kind, HostEvent::Pointer { overlay, phase, event });
  }

  pub fn click_overlay(&mut self, overlay: NodeId) {
    self.queue_if(overlay, ListenerKind::Click, HostEvent::OverlayClick { overlay });
  }

  pub fn resize_viewport(&mut self, width: f64, height: f64) {
    self.viewport = Size::new(width, height);
    let document = self.document();
    self.queue_if(document, ListenerKind::ViewportResize, HostEvent::ViewportResize);
  }

  pub fn toggle_fullscreen(&mut self) {
    let document = self.document();
    self.queue_if(document, ListenerKind::FullscreenChange, HostEvent::FullscreenChange);
  }

  pub fn resize_video(&mut self, video: NodeId, width: f64, height: f64) {
    if let Some(node) = self.get_mut(video) {
      let rect = node.rect.unwrap_or_default();
      node.rect = Some(Rect { width, height, ..rect });
    }
    self.queue_if(video, ListenerKind::VideoResize, HostEvent::VideoResize { video });
  }

  // --- Delivery ---

  /// Next event for the feature. Pending mutations go first, batched.
  pub fn pop_event(&mut self) -> Option<HostEvent> {
    if !self.pending_mutations.is_empty() {
      return Some(HostEvent::Mutations(std::mem::take(&mut self.pending_mutations)));
    }
    self.queue.pop_front()
  }

  pub fn next_deadline(&self) -> Option<Duration> {
    self.timers.values().map(|(deadline, _)| *deadline).min()
  }

  /// Remove the earliest timer due at or before `until`, moving the clock
  /// to its deadline.
  pub fn pop_due_timer(&mut self, until: Duration) -> Option<(TimerId, TimerTask)> {
    let (id, deadline) = self
      .timers
      .iter()
      .filter(|(_, (deadline, _))| *deadline <= until)
      .min_by_key(|(id, (deadline, _))| (*deadline, **id))
      .map(|(id, (deadline, _))| (*id, *deadline))?;
    let (_, task) = self.timers.remove(&id)?;
    self.now = self.now.max(deadline);
    Some((id, task))
  }

  pub fn take_due_timers(&mut self, until: Duration) -> Vec<(TimerId, TimerTask)> {
    std::iter::from_fn(|| self.pop_due_timer(until)).collect()
  }

  /// Move the clock without firing anything.
  pub fn advance_clock(&mut self, by: Duration) {
    self.now += by;
  }

  /// Deliver queued events until none are left.
  pub fn settle(&mut self, feature: &mut FeatureController) -> Vec<Disposition> {
    let mut dispositions = Vec::new();
    while let Some(event) = self.pop_event() {
      dispositions.push(feature.handle_event(self, event));
    }
    dispositions
  }

  /// Advance the clock to `until`, firing due timers in deadline order and
  /// settling after each.
  pub fn run_until(&mut self, feature: &mut FeatureController, until: Duration) {
    self.settle(feature);
    while let Some((id, task)) = self.pop_due_timer(until) {
      feature.handle_event(self, HostEvent::Timer { id, task });
      self.settle(feature);
    }
    self.now = self.now.max(until);
  }

  pub fn run_for(&mut self, feature: &mut FeatureController, by: Duration) {
    let until = self.now + by;
    self.run_until(feature, until);
  }
}

impl Dom for SimDocument {
  fn document(&self) -> NodeId {
    NodeId(0)
  }

  fn node(&self, id: NodeId) -> NodeRef {
    match self.get(id).map(|n| &n.kind) {
      Some(SimKind::Document) => NodeRef::Document(id),
      Some(SimKind::ShadowRoot) => NodeRef::ShadowRoot(id),
      Some(SimKind::Video) => NodeRef::Video(id),
      Some(SimKind::Element(_)) | Some(SimKind::Overlay) => NodeRef::Element(id),
      None => NodeRef::Leaf(id),
    }
  }

  fn children(&self, id: NodeId) -> Vec<NodeId> {
    self.get(id).map(|n| n.children.clone()).unwrap_or_default()
  }

  fn shadow_root(&self, id: NodeId) -> Option<NodeId> {
    self.get(id).and_then(|n| n.shadow_root)
  }

  fn parent_element(&self, id: NodeId) -> Option<NodeId> {
    let parent = self.get(id)?.parent?;
    match self.get(parent)?.kind {
      SimKind::Document | SimKind::ShadowRoot => None,
      _ => Some(parent),
    }
  }

  fn shadow_host(&self, id: NodeId) -> Option<NodeId> {
    let mut current = id;
    while let Some(parent) = self.get(current)?.parent {
      current = parent;
    }
    let root = self.get(current)?;
    if root.kind == SimKind::ShadowRoot { root.shadow_host } else { None }
  }

  fn is_connected(&self, id: NodeId) -> bool {
    let mut current = Some(id);
    while let Some(node_id) = current {
      let Some(node) = self.get(node_id) else {
        return false;
      };
      match node.kind {
        SimKind::Document => return true,
        SimKind::ShadowRoot => current = node.shadow_host,
        _ => current = node.parent,
      }
    }
    false
  }

  fn is_editable(&self, id: NodeId) -> bool {
    self.get(id).is_some_and(|n| n.editable)
  }

  fn bounding_rect(&self, id: NodeId) -> Option<Rect> {
    self.get(id)?.rect
  }

  fn viewport(&self) -> Size {
    self.viewport
  }

  fn element_size(&self, id: NodeId) -> Option<Size> {
    self.get(id)?.rect.map(|r| Size::new(r.width, r.height))
  }

  fn computed_position(&self, id: NodeId) -> CssPosition {
    self.get(id).map_or(CssPosition::Static, |n| n.inline_position.unwrap_or(n.computed_position))
  }

  fn inline_position(&self, id: NodeId) -> Option<CssPosition> {
    self.get(id)?.inline_position
  }

  fn set_inline_position(&mut self, id: NodeId, position: Option<CssPosition>) {
    if let Some(node) = self.get_mut(id) {
      node.inline_position = position;
    }
  }

  fn create_overlay(&mut self) -> NodeId {
    self.push(SimNode::new(SimKind::Overlay))
  }

  fn append_child(&mut self, parent: NodeId, child: NodeId) {
    if self.get(parent).is_none() || self.get(child).is_none() {
      return;
    }
    self.remove_child(child);
    if let Some(node) = self.get_mut(parent) {
      node.children.push(child);
    }
    if let Some(node) = self.get_mut(child) {
      node.parent = Some(parent);
    }
    if self.in_observed_tree(parent) {
      self.pending_mutations.push(MutationRecord { added: vec![child], removed: Vec::new() });
    }
  }

  fn remove_child(&mut self, child: NodeId) {
    let Some(parent) = self.get(child).and_then(|n| n.parent) else {
      return;
    };
    let observed = self.in_observed_tree(parent);
    if let Some(node) = self.get_mut(parent) {
      node.children.retain(|c| *c != child);
    }
    if let Some(node) = self.get_mut(child) {
      node.parent = None;
    }
    if observed {
      self.pending_mutations.push(MutationRecord { added: Vec::new(), removed: vec![child] });
    }
  }

  fn render_overlay(&mut self, id: NodeId, view: &OverlayView) {
    if let Some(node) = self.get_mut(id) {
      node.view = Some(view.clone());
    }
  }

  fn observe_mutations(&mut self, root: NodeId) {
    self.observed_root = Some(root);
  }

  fn disconnect_mutations(&mut self) {
    self.observed_root = None;
    self.pending_mutations.clear();
  }
}

impl Media for SimDocument {
  fn playback_rate(&self, video: NodeId) -> f64 {
    self.media(video).rate
  }

  fn set_playback_rate(&mut self, video: NodeId, rate: f64) {
    let Some(media) = self.media_mut(video) else {
      return;
    };
    media.rate_writes.push(rate);
    if media.rate == rate {
      return;
    }
    media.rate = rate;
    self.queue_if(video, ListenerKind::RateChange, HostEvent::RateChange { video });
  }

  fn current_time(&self, video: NodeId) -> f64 {
    self.media(video).current_time
  }

  fn set_current_time(&mut self, video: NodeId, time: f64) -> Result<()> {
    let media = self.media_mut(video).ok_or_else(|| anyhow!("node {:?} is not a video", video))?;
    if !media.seekable {
      return Err(anyhow!("media is not seekable"));
    }
    media.current_time = time;
    media.seeks.push(time);
    Ok(())
  }

  fn duration(&self, video: NodeId) -> Option<f64> {
    self.media(video).duration.filter(|d| d.is_finite())
  }

  fn paused(&self, video: NodeId) -> bool {
    self.media(video).paused
  }
}

impl Events for SimDocument {
  fn listen(&mut self, target: NodeId, kind: ListenerKind) -> ListenerId {
    self.next_listener += 1;
    let id = ListenerId(self.next_listener);
    self.listeners.insert(id, (target, kind));
    id
  }

  fn unlisten(&mut self, id: ListenerId) {
    self.listeners.remove(&id);
  }

  fn supports_resize_observer(&self) -> bool {
    self.resize_observer
  }

  fn supports_picture_in_picture(&self) -> bool {
    self.picture_in_picture
  }

  fn set_pointer_capture(&mut self, element: NodeId, pointer_id: i32) {
    self.pointer_capture = Some((element, pointer_id));
  }

  fn release_pointer_capture(&mut self, element: NodeId, pointer_id: i32) {
    if self.pointer_capture == Some((element, pointer_id)) {
      self.pointer_capture = None;
    }
  }
}

impl Scheduler for SimDocument {
  fn now(&self) -> Duration {
    self.now
  }

  fn set_timeout(&mut self, delay: Duration, task: TimerTask) -> TimerId {
    self.next_timer += 1;
    let id = TimerId(self.next_timer);
    self.timers.insert(id, (self.now + delay, task));
    id
  }

  fn clear_timeout(&mut self, id: TimerId) {
    self.timers.remove(&id);
  }
}
