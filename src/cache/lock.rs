//! Advisory cross-process lock guarding a cache file.
//!
//! The lock is a sidecar `<file>.lock` created exclusively. The holder touches
//! its modification time on a heartbeat; a lock whose mtime is older than the
//! staleness timeout is treated as abandoned and taken over, so a crashed
//! holder can't wedge the file forever.

use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
  /// A lock not refreshed for this long is considered abandoned.
  pub stale: Duration,
  /// Heartbeat interval. Must be shorter than `stale`.
  pub update: Duration,
  /// Extra attempts while another holder owns a fresh lock.
  pub retries: u32,
  pub retry_delay: Duration,
}

impl Default for LockOptions {
  fn default() -> Self {
    Self {
      stale: Duration::from_secs(10),
      update: Duration::from_secs(5),
      retries: 0,
      retry_delay: Duration::from_millis(200),
    }
  }
}

/// Held advisory lock. Released explicitly with [`FileLock::release`], or on drop.
pub struct FileLock {
  path: PathBuf,
  heartbeat: Option<JoinHandle<()>>,
  released: bool,
}

impl FileLock {
  /// Sidecar lock path for a cache file.
  pub fn path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
  }

  pub async fn acquire(target: &Path, options: &LockOptions) -> Result<Self> {
    let path = Self::path_for(target);
    let mut attempt = 0;

    loop {
      match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
      {
        Ok(_) => {
          debug!("Acquired lock {}", path.display());
          let heartbeat = tokio::spawn(heartbeat(path.clone(), options.update));
          return Ok(Self {
            path,
            heartbeat: Some(heartbeat),
            released: false,
          });
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
          if is_stale(&path, options.stale).await? {
            warn!("Taking over stale lock {}", path.display());
            remove_if_exists(&path)
              .await
              .map_err(|e| eyre!("Failed to remove stale lock {}: {}", path.display(), e))?;
            continue;
          }

          if attempt >= options.retries {
            return Err(CacheError::LockHeld { path }.into());
          }
          attempt += 1;
          tokio::time::sleep(options.retry_delay).await;
        }
        Err(e) => {
          return Err(eyre!("Failed to create lock {}: {}", path.display(), e));
        }
      }
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub async fn release(mut self) -> Result<()> {
    self.stop_heartbeat();
    self.released = true;
    remove_if_exists(&self.path)
      .await
      .map_err(|e| eyre!("Failed to release lock {}: {}", self.path.display(), e))?;
    debug!("Released lock {}", self.path.display());
    Ok(())
  }

  fn stop_heartbeat(&mut self) {
    if let Some(handle) = self.heartbeat.take() {
      handle.abort();
    }
  }
}

impl Drop for FileLock {
  fn drop(&mut self) {
    self.stop_heartbeat();
    if !self.released {
      let _ = std::fs::remove_file(&self.path);
    }
  }
}

async fn heartbeat(path: PathBuf, every: Duration) {
  let mut ticker = tokio::time::interval(every);
  // First tick completes immediately.
  ticker.tick().await;
  loop {
    ticker.tick().await;
    if let Err(e) = touch(&path).await {
      warn!("Lock {} compromised, heartbeat stopped: {}", path.display(), e);
      return;
    }
  }
}

async fn touch(path: &Path) -> io::Result<()> {
  let path = path.to_path_buf();
  tokio::task::spawn_blocking(move || {
    std::fs::OpenOptions::new()
      .write(true)
      .open(&path)?
      .set_modified(SystemTime::now())
  })
  .await
  .map_err(io::Error::other)?
}

async fn is_stale(path: &Path, stale: Duration) -> Result<bool> {
  let metadata = match tokio::fs::metadata(path).await {
    Ok(metadata) => metadata,
    // Holder released it between our attempts.
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
    Err(e) => return Err(eyre!("Failed to inspect lock {}: {}", path.display(), e)),
  };
  let modified = metadata
    .modified()
    .map_err(|e| eyre!("Failed to read lock mtime {}: {}", path.display(), e))?;
  Ok(
    SystemTime::now()
      .duration_since(modified)
      .map(|age| age > stale)
      .unwrap_or(false),
  )
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
  match tokio::fs::remove_file(path).await {
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    other => other,
  }
}
