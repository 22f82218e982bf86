//! Subscriber setup for the binary. Library code only emits events.

use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::constants::constants;

/// Environment variable holding the filter directives, e.g. `vidpace=debug`.
pub const LOG_ENV: &str = "VIDPACE_LOG";

/// `<data dir>/vidpace`, where the log file lives.
pub fn log_dir() -> Result<PathBuf> {
  let proj_dirs = ProjectDirs::from("", "", "vidpace").ok_or_else(|| anyhow!("No home directory found"))?;
  Ok(proj_dirs.data_dir().to_path_buf())
}

fn filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber, writing to the log file or to stderr.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// until the process exits.
pub fn init(to_stderr: bool) -> Result<Option<WorkerGuard>> {
  if to_stderr {
    tracing_subscriber::registry()
      .with(filter())
      .with(fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .context("Failed to install log subscriber")?;
    return Ok(None);
  }

  let dir = log_dir()?;
  std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
  let appender = tracing_appender::rolling::never(&dir, &constants().log_file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::registry()
    .with(filter())
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .try_init()
    .context("Failed to install log subscriber")?;
  Ok(Some(guard))
}
