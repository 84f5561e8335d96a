use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_ENV: &str = "TIERCACHE_LOG";

/// Install the global subscriber: a daily rolling file in `log_dir`, mirrored
/// to stderr when `verbose` is set.
///
/// The returned guard flushes the file writer on drop and must live as long
/// as the program does.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = rolling::daily(log_dir, "tiercache.log");
  let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(non_blocking_file)
    .with_ansi(false)
    .with_target(true)
    .with_filter(env_filter());

  let stderr_layer = verbose.then(|| {
    tracing_subscriber::fmt::layer()
      .with_writer(io::stderr)
      .with_target(false)
      .with_filter(env_filter())
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

/// `TIERCACHE_LOG` wins over `RUST_LOG`; both fall back to `info`.
fn env_filter() -> EnvFilter {
  let var = if std::env::var_os(LOG_ENV).is_some() {
    LOG_ENV
  } else {
    EnvFilter::DEFAULT_ENV
  };
  EnvFilter::builder()
    .with_default_directive(LevelFilter::INFO.into())
    .with_env_var(var)
    .from_env_lossy()
}
