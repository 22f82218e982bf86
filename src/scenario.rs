//! Scripted sessions against the in-memory document.
//!
//! A scenario is a RON file: optional settings, `setup` steps that build
//! the page before the feature starts, then `steps` replayed against the
//! running feature. `Print` steps produce [`Report`]s.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{debug, info};

use crate::feature::FeatureController;
use crate::geometry::Rect;
use crate::host::{ActivationKind, Dom, KeyEvent, Media, NodeId, PointerEvent, PointerPhase, Scheduler};
use crate::settings::{Settings, SettingsPatch};
use crate::sim::{SimDocument, VideoSpec};
use crate::store::{SettingsStore, SubscriptionId};

fn default_width() -> f64 {
  640.0
}

fn default_height() -> f64 {
  360.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Step {
  AddContainer {
    id: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default = "default_width")]
    width: f64,
    #[serde(default = "default_height")]
    height: f64,
    #[serde(default)]
    left: f64,
    #[serde(default)]
    top: f64,
  },
  /// With `shadow`, the video goes into the parent's shadow root.
  AddVideo {
    id: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default = "default_width")]
    width: f64,
    #[serde(default = "default_height")]
    height: f64,
    #[serde(default)]
    left: f64,
    #[serde(default)]
    top: f64,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    shadow: bool,
  },
  Remove(String),
  Play(String),
  Pause(String),
  Activate(String, ActivationKind),
  KeyDown(String),
  KeyUp(String),
  /// Key-down immediately followed by key-up.
  Tap(String),
  Wait(u64),
  Drag {
    video: String,
    dx: f64,
    dy: f64,
  },
  ResizeVideo {
    id: String,
    width: f64,
    height: f64,
  },
  ResizeViewport {
    width: f64,
    height: f64,
  },
  ToggleFullscreen,
  /// Rate change made by the page's own controls.
  SetRate(String, f64),
  /// Write to the settings store, as the settings panel would.
  Settings(SettingsPatch),
  Print,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
  pub settings: Option<SettingsPatch>,
  pub setup: Vec<Step>,
  pub steps: Vec<Step>,
}

impl Scenario {
  pub fn load(path: &Path) -> Result<Self> {
    let content =
      std::fs::read_to_string(path).with_context(|| format!("Failed to read scenario {}", path.display()))?;
    Self::parse(&content).with_context(|| format!("Failed to parse scenario {}", path.display()))
  }

  pub fn parse(content: &str) -> Result<Self> {
    Ok(ron::from_str(content)?)
  }
}

// --- Reports ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayReport {
  pub text: String,
  pub visible: bool,
  pub left: f64,
  pub top: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoReport {
  pub id: String,
  pub bound: bool,
  pub rate: f64,
  pub current_time: f64,
  pub paused: bool,
  pub overlay: Option<OverlayReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
  pub time_ms: u64,
  pub active: Option<String>,
  pub step_seconds: f64,
  pub last_custom_speed: f64,
  pub videos: Vec<VideoReport>,
}

// --- Session ---

/// One document, one feature and the store subscription feeding settings
/// changes back into it.
pub struct Session {
  doc: SimDocument,
  feature: FeatureController,
  nodes: Vec<(String, NodeId)>,
  videos: Vec<(String, NodeId)>,
  settings_rx: UnboundedReceiver<Settings>,
  subscription: SubscriptionId,
  started: bool,
}

impl Session {
  pub fn new(mut store: Box<dyn SettingsStore>) -> Self {
    let (tx, settings_rx) = unbounded_channel();
    let subscription = store.subscribe(Box::new(move |settings: &Settings| {
      let _ = tx.send(settings.clone());
    }));
    let settings = store.get();
    Self {
      doc: SimDocument::new(),
      feature: FeatureController::new(settings, store),
      nodes: Vec::new(),
      videos: Vec::new(),
      settings_rx,
      subscription,
      started: false,
    }
  }

  /// Apply the scenario's settings, build its page, start the feature and
  /// replay every step. Returns the reports in order.
  pub fn replay(scenario: &Scenario, mut store: Box<dyn SettingsStore>) -> Result<Vec<Report>> {
    if let Some(patch) = &scenario.settings {
      store.set(patch).context("Failed to apply scenario settings")?;
    }
    let mut session = Self::new(store);
    for step in &scenario.setup {
      session.apply(step)?;
    }
    session.start();
    let mut reports = Vec::new();
    for step in &scenario.steps {
      if let Some(report) = session.apply(step)? {
        reports.push(report);
      }
    }
    session.shutdown();
    Ok(reports)
  }

  pub fn feature(&self) -> &FeatureController {
    &self.feature
  }

  pub fn document(&self) -> &SimDocument {
    &self.doc
  }

  pub fn now(&self) -> Duration {
    self.doc.now()
  }

  pub fn next_deadline(&self) -> Option<Duration> {
    self.doc.next_deadline()
  }

  pub fn start(&mut self) {
    if self.started {
      return;
    }
    self.started = true;
    self.feature.init(&mut self.doc);
    self.settle();
  }

  pub fn shutdown(&mut self) {
    if !self.started {
      return;
    }
    self.started = false;
    self.feature.dispose(&mut self.doc);
    let subscription = self.subscription;
    self.feature.store_mut().unsubscribe(subscription);
    info!(time_ms = self.doc.now().as_millis() as u64, "session: finished");
  }

  /// Move the clock forward to `until`, firing timers on the way.
  pub fn advance_to(&mut self, until: Duration) {
    if until <= self.doc.now() {
      return;
    }
    self.doc.run_until(&mut self.feature, until);
    self.sync_settings();
  }

  /// Pick up settings written by another process.
  pub fn refresh_store(&mut self) {
    if self.feature.store_mut().refresh() {
      self.sync_settings();
    }
  }

  fn settle(&mut self) {
    self.doc.settle(&mut self.feature);
    self.sync_settings();
  }

  fn sync_settings(&mut self) {
    let mut latest = None;
    while let Ok(settings) = self.settings_rx.try_recv() {
      latest = Some(settings);
    }
    if let Some(settings) = latest {
      debug!("session: settings changed");
      self.feature.update_settings(&mut self.doc, settings);
    }
  }

  fn lookup(&self, id: &str) -> Result<NodeId> {
    self.nodes.iter().find(|(name, _)| name == id).map(|(_, node)| *node).ok_or_else(|| anyhow!("Unknown node '{}'", id))
  }

  fn name_of(&self, node: NodeId) -> Option<String> {
    self.nodes.iter().find(|(_, n)| *n == node).map(|(name, _)| name.clone())
  }

  fn register(&mut self, id: &str, node: NodeId) -> Result<()> {
    if self.nodes.iter().any(|(name, _)| name == id) {
      bail!("Duplicate node id '{}'", id);
    }
    self.nodes.push((id.to_string(), node));
    Ok(())
  }

  fn parent_for(&self, parent: &Option<String>) -> Result<NodeId> {
    match parent {
      Some(name) => self.lookup(name),
      None => Ok(self.doc.document()),
    }
  }

  fn overlay_element(&self, video: &str) -> Result<NodeId> {
    let video = self.lookup(video)?;
    self.feature.overlay(video).map(|o| o.element()).ok_or_else(|| anyhow!("Video {:?} has no overlay", video))
  }

  pub fn apply(&mut self, step: &Step) -> Result<Option<Report>> {
    debug!(step = ?step, "session: step");
    match step {
      Step::AddContainer { id, parent, width, height, left, top } => {
        let parent = self.parent_for(parent)?;
        let node = self.doc.create_element("div");
        self.doc.set_rect(node, Rect::new(*left, *top, *width, *height));
        self.register(id, node)?;
        self.doc.append(parent, node);
      }
      Step::AddVideo { id, parent, width, height, left, top, duration, shadow } => {
        let mut parent = self.parent_for(parent)?;
        if *shadow {
          parent = self.doc.shadow_root(parent).unwrap_or_else(|| self.doc.attach_shadow(parent));
        }
        let spec =
          VideoSpec { width: *width, height: *height, left: *left, top: *top, duration: *duration, ..Default::default() };
        let video = self.doc.create_video(spec);
        self.register(id, video)?;
        self.videos.push((id.clone(), video));
        self.doc.append(parent, video);
      }
      Step::Remove(id) => {
        let node = self.lookup(id)?;
        self.doc.remove(node);
      }
      Step::Play(id) => {
        let node = self.lookup(id)?;
        self.doc.play(node);
      }
      Step::Pause(id) => {
        let node = self.lookup(id)?;
        self.doc.pause(node);
      }
      Step::Activate(id, kind) => {
        let node = self.lookup(id)?;
        self.doc.activate(node, *kind);
      }
      Step::KeyDown(key) => self.doc.key_down(KeyEvent::new(key.as_str())),
      Step::KeyUp(key) => self.doc.key_up(KeyEvent::new(key.as_str())),
      Step::Tap(key) => {
        self.doc.key_down(KeyEvent::new(key.as_str()));
        self.settle();
        self.doc.key_up(KeyEvent::new(key.as_str()));
      }
      Step::Wait(ms) => {
        self.settle();
        let until = self.doc.now() + Duration::from_millis(*ms);
        self.advance_to(until);
      }
      Step::Drag { video, dx, dy } => {
        let element = self.overlay_element(video)?;
        let phases = [(PointerPhase::Down, 0.0, 0.0), (PointerPhase::Move, *dx, *dy), (PointerPhase::Up, *dx, *dy)];
        for (phase, x, y) in phases {
          self.doc.pointer(element, phase, PointerEvent { x, y, ..Default::default() });
          self.settle();
        }
      }
      Step::ResizeVideo { id, width, height } => {
        let node = self.lookup(id)?;
        self.doc.resize_video(node, *width, *height);
      }
      Step::ResizeViewport { width, height } => self.doc.resize_viewport(*width, *height),
      Step::ToggleFullscreen => self.doc.toggle_fullscreen(),
      Step::SetRate(id, rate) => {
        let node = self.lookup(id)?;
        self.doc.set_rate_externally(node, *rate);
      }
      Step::Settings(patch) => {
        self.feature.store_mut().set(patch).context("Failed to write settings")?;
      }
      Step::Print => {
        self.settle();
        return Ok(Some(self.report()));
      }
    }
    self.settle();
    Ok(None)
  }

  pub fn report(&self) -> Report {
    let videos = self
      .videos
      .iter()
      .map(|(id, video)| {
        let overlay = self
          .feature
          .overlay(*video)
          .and_then(|o| self.doc.overlay_view(o.element()))
          .map(|view| OverlayReport { text: view.text.clone(), visible: view.visible, left: view.left, top: view.top });
        VideoReport {
          id: id.clone(),
          bound: self.feature.is_bound(*video),
          rate: self.doc.playback_rate(*video),
          current_time: self.doc.current_time(*video),
          paused: self.doc.paused(*video),
          overlay,
        }
      })
      .collect();
    Report {
      time_ms: self.doc.now().as_millis() as u64,
      active: self.feature.active_video().and_then(|v| self.name_of(v)),
      step_seconds: self.feature.settings().current_step(),
      last_custom_speed: self.feature.last_custom_speed(),
      videos,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;

  fn replay(source: &str) -> Vec<Report> {
    let scenario = Scenario::parse(source).unwrap();
    Session::replay(&scenario, Box::new(MemoryStore::default())).unwrap()
  }

  #[test]
  fn tap_then_hold_on_advance() {
    let reports = replay(
      r#"(
        setup: [
          AddContainer(id: "box"),
          AddVideo(id: "clip", parent: Some("box"), duration: Some(60.0)),
        ],
        steps: [
          Tap("x"),
          Print,
          KeyDown("x"),
          Wait(300),
          Print,
          KeyUp("x"),
          Print,
        ],
      )"#,
    );
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].videos[0].current_time, 10.0);
    assert_eq!(reports[0].videos[0].rate, 1.0);
    assert_eq!(reports[1].videos[0].rate, 2.0);
    assert_eq!(reports[2].videos[0].rate, 1.0);
    assert_eq!(reports[2].videos[0].current_time, 10.0);
    assert_eq!(reports[2].time_ms, 300);
  }

  #[test]
  fn scenario_settings_apply_before_start() {
    let reports = replay(
      r#"(
        settings: Some((fast_forward_speed: Some(3.0), rewind_advance_current_step: Some(5.0))),
        setup: [AddVideo(id: "clip")],
        steps: [KeyDown("x"), Wait(260), Print],
      )"#,
    );
    assert_eq!(reports[0].videos[0].rate, 3.0);
    assert_eq!(reports[0].step_seconds, 5.0);
  }

  #[test]
  fn store_writes_flow_back_into_overlays() {
    let reports = replay(
      r#"(
        setup: [AddContainer(id: "box"), AddVideo(id: "clip", parent: Some("box"))],
        steps: [
          Print,
          Settings((show_current_speed: Some(false))),
          Print,
        ],
      )"#,
    );
    assert!(reports[0].videos[0].overlay.as_ref().unwrap().visible);
    assert!(!reports[1].videos[0].overlay.as_ref().unwrap().visible);
  }

  #[test]
  fn focus_follows_activation_across_shadow_roots() {
    let reports = replay(
      r#"(
        setup: [
          AddContainer(id: "a"),
          AddVideo(id: "first", parent: Some("a")),
          AddContainer(id: "shell"),
          AddVideo(id: "inner", parent: Some("shell"), shadow: true),
        ],
        steps: [
          Activate("inner", Click),
          Tap("d"),
          Print,
          Remove("shell"),
          Print,
        ],
      )"#,
    );
    assert_eq!(reports[0].active.as_deref(), Some("inner"));
    assert_eq!(reports[0].videos[0].rate, 1.0);
    assert!((reports[0].videos[1].rate - 1.1).abs() < 1e-9);
    assert!(!reports[1].videos[1].bound);
    assert_eq!(reports[1].active.as_deref(), Some("first"));
  }

  #[test]
  fn videos_added_after_start_are_bound() {
    let reports = replay(
      r#"(
        steps: [
          AddContainer(id: "box"),
          AddVideo(id: "late", parent: Some("box")),
          Print,
        ],
      )"#,
    );
    assert!(reports[0].videos[0].bound);
    assert_eq!(reports[0].active.as_deref(), Some("late"));
  }

  #[test]
  fn unknown_nodes_are_reported() {
    let scenario = Scenario::parse(r#"(steps: [Remove("ghost")])"#).unwrap();
    let err = Session::replay(&scenario, Box::new(MemoryStore::default())).unwrap_err();
    assert!(err.to_string().contains("ghost"));
  }

  #[test]
  fn shipped_scenarios_replay() {
    let reports = replay(include_str!("../scenarios/tap_and_hold.ron"));
    let rates: Vec<f64> = reports.iter().map(|r| r.videos[0].rate).collect();
    assert_eq!(rates, vec![1.0, 2.5, 1.0, 0.5, 1.0]);
    assert_eq!(reports[0].videos[0].current_time, 10.0);

    let reports = replay(include_str!("../scenarios/two_players.ron"));
    assert_eq!(reports.len(), 4);
    assert_eq!(reports[0].step_seconds, 2.0);
    assert_eq!(reports[2].active.as_deref(), Some("preview"));
    assert!(!reports[3].videos[1].bound);
  }

  #[test]
  fn malformed_scenario_is_an_error() {
    assert!(Scenario::parse("(steps: [Explode])").is_err());
  }
}
