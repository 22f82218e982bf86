//! Host document contract.
//!
//! The feature never owns the document. Every operation that touches it
//! borrows a [`Host`] for the duration of the call, and the host feeds
//! everything that happens back in as [`HostEvent`]s: DOM mutations, key
//! and pointer input, media notifications and fired timers.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::geometry::{Rect, Size};
use crate::hold::HoldKind;

// --- Identities ---

/// Stable node identity. A removed node keeps its id, so teardown can
/// still address it after it left the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

// --- Node classification ---

/// Capability-typed view of a node, used by tree walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
  Document(NodeId),
  ShadowRoot(NodeId),
  Element(NodeId),
  Video(NodeId),
  Leaf(NodeId),
}

impl NodeRef {
  pub fn id(self) -> NodeId {
    match self {
      NodeRef::Document(id) | NodeRef::ShadowRoot(id) | NodeRef::Element(id) | NodeRef::Video(id) | NodeRef::Leaf(id) => {
        id
      }
    }
  }

  /// Only elements can host a shadow root.
  pub fn can_host_shadow(self) -> bool {
    matches!(self, NodeRef::Element(_) | NodeRef::Video(_))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CssPosition {
  #[default]
  Static,
  Relative,
  Absolute,
  Fixed,
  Sticky,
}

impl fmt::Display for CssPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      CssPosition::Static => "static",
      CssPosition::Relative => "relative",
      CssPosition::Absolute => "absolute",
      CssPosition::Fixed => "fixed",
      CssPosition::Sticky => "sticky",
    };
    f.write_str(s)
  }
}

/// Everything the host needs to paint one overlay badge.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayView {
  pub text: String,
  pub visible: bool,
  pub dragging: bool,
  pub left: f64,
  pub top: f64,
  pub font_size: f64,
  pub background_alpha: f64,
}

// --- Events ---

/// Interaction signals that make a video the keyboard target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationKind {
  Click,
  PointerDown,
  Play,
  Focus,
  MouseEnter,
  EnterPictureInPicture,
  LeavePictureInPicture,
}

impl ActivationKind {
  pub const ALWAYS: [ActivationKind; 5] = [
    ActivationKind::Click,
    ActivationKind::PointerDown,
    ActivationKind::Play,
    ActivationKind::Focus,
    ActivationKind::MouseEnter,
  ];

  pub const PICTURE_IN_PICTURE: [ActivationKind; 2] =
    [ActivationKind::EnterPictureInPicture, ActivationKind::LeavePictureInPicture];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
  KeyDown,
  KeyUp,
  Activation(ActivationKind),
  RateChange,
  VideoResize,
  ViewportResize,
  FullscreenChange,
  PointerDown,
  PointerMove,
  PointerUp,
  PointerCancel,
  Click,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyEvent {
  pub key: String,
  pub repeat: bool,
  pub default_prevented: bool,
  pub alt: bool,
  pub ctrl: bool,
  pub meta: bool,
  pub target: Option<NodeId>,
}

impl KeyEvent {
  pub fn new(key: impl Into<String>) -> Self {
    Self { key: key.into(), ..Default::default() }
  }

  pub fn has_modifier(&self) -> bool {
    self.alt || self.ctrl || self.meta
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerType {
  #[default]
  Mouse,
  Pen,
  Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
  Down,
  Move,
  Up,
  Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointerEvent {
  pub pointer_id: i32,
  pub pointer_type: PointerType,
  pub button: i16,
  pub x: f64,
  pub y: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationRecord {
  pub added: Vec<NodeId>,
  pub removed: Vec<NodeId>,
}

/// Work scheduled through [`Scheduler::set_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTask {
  HoldActivate(HoldKind),
  HideOverlay { video: NodeId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
  Mutations(Vec<MutationRecord>),
  KeyDown(KeyEvent),
  KeyUp(KeyEvent),
  Activation { video: NodeId, kind: ActivationKind },
  RateChange { video: NodeId },
  Pointer { overlay: NodeId, phase: PointerPhase, event: PointerEvent },
  OverlayClick { overlay: NodeId },
  ViewportResize,
  FullscreenChange,
  VideoResize { video: NodeId },
  Timer { id: TimerId, task: TimerTask },
}

/// What the host should do with the event after the feature saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  Ignored,
  /// Prevent the default action and stop propagation.
  Consumed,
}

impl Disposition {
  pub fn is_consumed(self) -> bool {
    self == Disposition::Consumed
  }
}

// --- Capabilities ---

pub trait Dom {
  fn document(&self) -> NodeId;
  fn node(&self, id: NodeId) -> NodeRef;
  fn children(&self, id: NodeId) -> Vec<NodeId>;
  fn shadow_root(&self, id: NodeId) -> Option<NodeId>;
  fn parent_element(&self, id: NodeId) -> Option<NodeId>;
  /// Host element of the shadow tree containing `id`, if any.
  fn shadow_host(&self, id: NodeId) -> Option<NodeId>;
  fn is_connected(&self, id: NodeId) -> bool;
  fn is_editable(&self, id: NodeId) -> bool;

  fn bounding_rect(&self, id: NodeId) -> Option<Rect>;
  fn viewport(&self) -> Size;
  /// Rendered size of an element, `None` before layout.
  fn element_size(&self, id: NodeId) -> Option<Size>;
  fn computed_position(&self, id: NodeId) -> CssPosition;
  fn inline_position(&self, id: NodeId) -> Option<CssPosition>;
  fn set_inline_position(&mut self, id: NodeId, position: Option<CssPosition>);

  fn create_overlay(&mut self) -> NodeId;
  fn append_child(&mut self, parent: NodeId, child: NodeId);
  fn remove_child(&mut self, child: NodeId);
  fn render_overlay(&mut self, id: NodeId, view: &OverlayView);

  fn observe_mutations(&mut self, root: NodeId);
  fn disconnect_mutations(&mut self);
}

pub trait Media {
  fn playback_rate(&self, video: NodeId) -> f64;
  fn set_playback_rate(&mut self, video: NodeId, rate: f64);
  fn current_time(&self, video: NodeId) -> f64;
  /// Fails on media that cannot seek.
  fn set_current_time(&mut self, video: NodeId, time: f64) -> Result<()>;
  /// `None` while the duration is unknown or infinite.
  fn duration(&self, video: NodeId) -> Option<f64>;
  fn paused(&self, video: NodeId) -> bool;
}

pub trait Events {
  fn listen(&mut self, target: NodeId, kind: ListenerKind) -> ListenerId;
  fn unlisten(&mut self, id: ListenerId);
  fn supports_resize_observer(&self) -> bool;
  fn supports_picture_in_picture(&self) -> bool;
  fn set_pointer_capture(&mut self, element: NodeId, pointer_id: i32);
  fn release_pointer_capture(&mut self, element: NodeId, pointer_id: i32);
}

/// Injectable timer source; fired timers come back as [`HostEvent::Timer`].
pub trait Scheduler {
  fn now(&self) -> Duration;
  fn set_timeout(&mut self, delay: Duration, task: TimerTask) -> TimerId;
  fn clear_timeout(&mut self, id: TimerId);
}

pub trait Host: Dom + Media + Events + Scheduler {}

impl<T: Dom + Media + Events + Scheduler> Host for T {}

/// Collect every video under `root`, descending into shadow roots before
/// regular children, in document order.
pub fn collect_videos<D: Dom + ?Sized>(dom: &D, root: NodeId) -> Vec<NodeId> {
  let mut found = Vec::new();
  visit(dom, root, &mut found);
  found
}

fn visit<D: Dom + ?Sized>(dom: &D, id: NodeId, found: &mut Vec<NodeId>) {
  let node = dom.node(id);
  if let NodeRef::Video(video) = node {
    found.push(video);
  }
  if node.can_host_shadow()
    && let Some(shadow) = dom.shadow_root(id)
  {
    visit(dom, shadow, found);
  }
  for child in dom.children(id) {
    visit(dom, child, found);
  }
}
