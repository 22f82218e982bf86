use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{info, warn};

use vidpace::logging;
use vidpace::scenario::{Scenario, Session, Step};
use vidpace::settings::{Settings, SettingsPatch};
use vidpace::store::{FileStore, MemoryStore, SettingsStore};

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
struct Args {
  /// Settings file (default: settings.toml in the user config directory)
  #[arg(long, global = true)]
  settings: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Replay a RON scenario and print one JSON report per `Print` step
  Replay {
    scenario: PathBuf,

    /// Write setting changes back to the settings file
    #[arg(long)]
    persist: bool,
  },
  /// Read one RON step per stdin line and run timers in real time
  Live,
  /// Inspect or edit the settings file
  Settings {
    #[command(subcommand)]
    action: SettingsAction,
  },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
  /// Print the normalized settings as TOML
  Show,
  /// Print the settings file location
  Path,
  /// Set one field, e.g. `set fast_forward_speed 2.5` or `set advance_key l`
  Set { field: String, value: String },
  /// Restore every default
  Reset,
}

fn open_store(path: Option<PathBuf>) -> Result<FileStore> {
  match path {
    Some(path) => Ok(FileStore::open(path)),
    None => FileStore::open_default(),
  }
}

// --- Commands ---

fn replay(path: PathBuf, store: FileStore, persist: bool) -> Result<()> {
  let scenario = Scenario::load(&path)?;
  let store: Box<dyn SettingsStore> = if persist { Box::new(store) } else { Box::new(MemoryStore::new(store.get())) };
  info!(scenario = %path.display(), steps = scenario.steps.len(), persist, "replay: starting");
  for report in Session::replay(&scenario, store)? {
    println!("{}", serde_json::to_string(&report)?);
  }
  Ok(())
}

async fn live(store: FileStore) -> Result<()> {
  let mut session = Session::new(Box::new(store));
  session.start();
  info!("live: reading steps from stdin");

  let origin = Instant::now();
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut refresh = tokio::time::interval(Duration::from_secs(1));

  loop {
    let deadline = session.next_deadline();
    let wait = timer_wait(deadline, origin.elapsed());
    let timer = async {
      match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
      }
    };

    tokio::select! {
      line = lines.next_line() => {
        let Some(line) = line.context("Failed to read stdin")? else {
          break;
        };
        session.advance_to(origin.elapsed());
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
          continue;
        }
        let step = match ron::from_str::<Step>(line) {
          Ok(step) => step,
          Err(e) => {
            eprintln!("invalid step: {}", e);
            continue;
          }
        };
        match session.apply(&step) {
          Ok(Some(report)) => println!("{}", serde_json::to_string(&report)?),
          Ok(None) => {}
          Err(e) => eprintln!("step failed: {:#}", e),
        }
      }
      _ = timer => {
        if let Some(deadline) = deadline {
          session.advance_to(deadline.max(origin.elapsed()));
        }
      }
      _ = refresh.tick() => session.refresh_store(),
    }
  }

  session.shutdown();
  Ok(())
}

/// Real-time wait until the next virtual deadline. The session clock only
/// moves on input and timers, so measure against wall time.
fn timer_wait(deadline: Option<Duration>, elapsed: Duration) -> Option<Duration> {
  deadline.map(|d| d.saturating_sub(elapsed))
}

/// Parse a command-line value as a TOML literal, falling back to a plain
/// string so `set advance_key l` works unquoted.
fn parse_value(raw: &str) -> serde_json::Value {
  toml::from_str::<toml::Table>(&format!("value = {}", raw))
    .ok()
    .and_then(|mut table| table.remove("value"))
    .and_then(|value| serde_json::to_value(value).ok())
    .unwrap_or_else(|| serde_json::Value::String(raw.to_string()))
}

fn settings(action: SettingsAction, mut store: FileStore) -> Result<()> {
  match action {
    SettingsAction::Show => {
      print!("{}", toml::to_string_pretty(&store.get()).context("Failed to serialize settings")?);
    }
    SettingsAction::Path => println!("{}", store.path().display()),
    SettingsAction::Set { field, value } => {
      let next = store.get().with_field(&field, parse_value(&value))?;
      let saved = store.set(&SettingsPatch::from(&next))?;
      if saved.to_value().get(&field) != next.to_value().get(&field) {
        warn!(field = %field, "settings: value changed during normalization");
      }
      println!("{} = {}", field, saved.to_value().get(&field).cloned().unwrap_or_default());
    }
    SettingsAction::Reset => {
      store.set(&SettingsPatch::from(&Settings::default()))?;
      println!("Settings reset: {}", store.path().display());
    }
  }
  Ok(())
}

// --- Main ---

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  let args = Args::parse();
  let _guard = logging::init(args.log_stderr)?;
  let store = open_store(args.settings)?;

  match args.command {
    Command::Replay { scenario, persist } => replay(scenario, store, persist),
    Command::Live => live(store).await,
    Command::Settings { action } => settings(action, store),
  }
}
