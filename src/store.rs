//! Durable settings storage with change notification.
//!
//! Two stores share the [`SettingsStore`] contract: [`MemoryStore`] keeps
//! everything in process, [`FileStore`] persists a TOML file in the user's
//! config directory and can pick up edits made by other processes.

use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::constants::constants;
use crate::settings::{Settings, SettingsPatch};

pub type SubscriptionId = u64;
pub type Listener = Box<dyn FnMut(&Settings)>;

/// Key-value configuration with change notification.
pub trait SettingsStore {
  /// Current normalized snapshot.
  fn get(&self) -> Settings;

  /// Merge `patch` into the current snapshot, normalize, persist and
  /// return the new snapshot. Subscribers are notified on success.
  fn set(&mut self, patch: &SettingsPatch) -> Result<Settings>;

  fn subscribe(&mut self, listener: Listener) -> SubscriptionId;

  fn unsubscribe(&mut self, id: SubscriptionId);

  /// Pick up writes made by someone else. Returns `true` when the snapshot
  /// changed; subscribers have been notified by then.
  fn refresh(&mut self) -> bool {
    false
  }
}

// --- Subscribers ---

#[derive(Default)]
struct Subscribers {
  next_id: SubscriptionId,
  listeners: Vec<(SubscriptionId, Listener)>,
}

impl Subscribers {
  fn add(&mut self, listener: Listener) -> SubscriptionId {
    self.next_id += 1;
    self.listeners.push((self.next_id, listener));
    self.next_id
  }

  fn remove(&mut self, id: SubscriptionId) {
    self.listeners.retain(|(existing, _)| *existing != id);
  }

  fn notify(&mut self, settings: &Settings) {
    for (_, listener) in self.listeners.iter_mut() {
      listener(settings);
    }
  }
}

// --- MemoryStore ---

#[derive(Default)]
pub struct MemoryStore {
  settings: Settings,
  subscribers: Subscribers,
}

impl MemoryStore {
  pub fn new(settings: Settings) -> Self {
    Self { settings: settings.normalized(), subscribers: Subscribers::default() }
  }
}

impl SettingsStore for MemoryStore {
  fn get(&self) -> Settings {
    self.settings.clone()
  }

  fn set(&mut self, patch: &SettingsPatch) -> Result<Settings> {
    self.settings = self.settings.merged(patch);
    self.subscribers.notify(&self.settings);
    Ok(self.settings.clone())
  }

  fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
    self.subscribers.add(listener)
  }

  fn unsubscribe(&mut self, id: SubscriptionId) {
    self.subscribers.remove(id);
  }
}

// --- FileStore ---

/// TOML-backed store. The file holds the normalized snapshot; unreadable
/// or malformed files are treated as empty and yield defaults.
pub struct FileStore {
  path: PathBuf,
  settings: Settings,
  last_raw: Option<String>,
  subscribers: Subscribers,
}

impl FileStore {
  /// Default location: `<config dir>/vidpace/settings.toml`.
  pub fn default_path() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "", "vidpace").ok_or_else(|| anyhow!("No home directory found"))?;
    Ok(proj_dirs.config_dir().join(&constants().settings_file_name))
  }

  pub fn open_default() -> Result<Self> {
    Ok(Self::open(Self::default_path()?))
  }

  pub fn open(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let raw = std::fs::read_to_string(&path).ok();
    let settings = raw.as_deref().map_or_else(Settings::default, |content| parse_settings(&path, content));
    debug!(path = %path.display(), "store: opened settings file");
    Self { path, settings, last_raw: raw, subscribers: Subscribers::default() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn write(&mut self, settings: &Settings) -> Result<()> {
    if let Some(dir) = self.path.parent() {
      std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let content = toml::to_string(settings).context("Failed to serialize settings")?;
    std::fs::write(&self.path, &content).with_context(|| format!("Failed to write {}", self.path.display()))?;
    self.last_raw = Some(content);
    Ok(())
  }
}

impl SettingsStore for FileStore {
  fn get(&self) -> Settings {
    self.settings.clone()
  }

  fn set(&mut self, patch: &SettingsPatch) -> Result<Settings> {
    let next = self.settings.merged(patch);
    self.write(&next)?;
    self.settings = next;
    self.subscribers.notify(&self.settings);
    Ok(self.settings.clone())
  }

  fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
    self.subscribers.add(listener)
  }

  fn unsubscribe(&mut self, id: SubscriptionId) {
    self.subscribers.remove(id);
  }

  fn refresh(&mut self) -> bool {
    let raw = std::fs::read_to_string(&self.path).ok();
    if raw == self.last_raw {
      return false;
    }
    let next = raw.as_deref().map_or_else(Settings::default, |content| parse_settings(&self.path, content));
    self.last_raw = raw;
    if next == self.settings {
      return false;
    }
    info!(path = %self.path.display(), "store: settings changed on disk");
    self.settings = next;
    self.subscribers.notify(&self.settings);
    true
  }
}

fn parse_settings(path: &Path, content: &str) -> Settings {
  match toml::from_str::<toml::Value>(content) {
    Ok(value) => Settings::from_value(&serde_json::to_value(value).unwrap_or_default()),
    Err(e) => {
      warn!(path = %path.display(), err = %e, "store: malformed settings file, using defaults");
      Settings::default()
    }
  }
}
