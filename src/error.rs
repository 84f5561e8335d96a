//! Error taxonomy for cache chains.
//!
//! Configuration mistakes surface as [`CacheError`] wrapped in an
//! [`eyre::Report`](color_eyre::eyre::Report), so callers can classify them with
//! `report.downcast_ref::<CacheError>()`. Storage failures are plain reports
//! annotated with the tier and the operation that failed. Failures raised while a
//! tier reacts to its source have no caller to return to and travel as
//! [`TierFailure`] values inside `CacheEvent::Error`.

use chrono::{DateTime, Utc};
use color_eyre::eyre::Report;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
  /// The tier list cannot be turned into a chain.
  #[error("invalid chain: {0}")]
  InvalidChain(String),

  #[error("{tier} does not take a source")]
  SourceNotAccepted { tier: String },

  #[error("expiration {expiration} is later than the current ceiling {ceiling}")]
  ExpirationBeyondCeiling {
    expiration: DateTime<Utc>,
    ceiling: DateTime<Utc>,
  },

  #[error("expiration {expiration} outlives the source expiration {source_expiration}")]
  ExpirationBeyondSource {
    expiration: DateTime<Utc>,
    source_expiration: DateTime<Utc>,
  },

  #[error("{tier} is not initialized")]
  NotInitialized { tier: String },

  #[error("{} is locked by another holder", .path.display())]
  LockHeld { path: PathBuf },
}

/// A failure raised while a tier reacted to an event from its source.
///
/// `path` lists the tiers the failure travelled through, the reporting tier first
/// and the tier where it happened last.
#[derive(Debug, Clone)]
pub struct TierFailure {
  pub path: Vec<String>,
  /// Event being handled by the reporting tier.
  pub event: &'static str,
  /// Event that triggered the failure where it happened.
  pub origin_event: &'static str,
  pub cause: Arc<Report>,
}

impl TierFailure {
  pub fn new(tier: &str, event: &'static str, cause: Report) -> Self {
    Self {
      path: vec![tier.to_string()],
      event,
      origin_event: event,
      cause: Arc::new(cause),
    }
  }

  /// Re-emit a source's failure from a dependent tier.
  pub fn rewrap(&self, tier: &str) -> Self {
    let mut path = Vec::with_capacity(self.path.len() + 1);
    path.push(tier.to_string());
    path.extend(self.path.iter().cloned());
    Self {
      path,
      event: "error",
      origin_event: self.origin_event,
      cause: Arc::clone(&self.cause),
    }
  }

  /// Tier reporting the failure.
  pub fn tier(&self) -> &str {
    self.path.first().map(String::as_str).unwrap_or_default()
  }

  /// Tier where the failure happened.
  pub fn origin_tier(&self) -> &str {
    self.path.last().map(String::as_str).unwrap_or_default()
  }
}

impl fmt::Display for TierFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.path.len() > 1 {
      write!(
        f,
        "{} failed while handling {} (raised by {} on {}): {:#}",
        self.tier(),
        self.event,
        self.origin_tier(),
        self.origin_event,
        self.cause
      )
    } else {
      write!(
        f,
        "{} failed while handling {}: {:#}",
        self.tier(),
        self.event,
        self.cause
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[test]
  fn test_rewrap_keeps_originating_event() {
    let failure = TierFailure::new("file#2", "cache-updated", eyre!("disk full"));
    let rewrapped = failure.rewrap("memory#1").rewrap("memory#0");

    assert_eq!(rewrapped.path, vec!["memory#0", "memory#1", "file#2"]);
    assert_eq!(rewrapped.event, "error");
    assert_eq!(rewrapped.origin_event, "cache-updated");
    assert_eq!(rewrapped.tier(), "memory#0");
    assert_eq!(rewrapped.origin_tier(), "file#2");
    assert!(Arc::ptr_eq(&failure.cause, &rewrapped.cause));
  }

  #[test]
  fn test_display_names_both_ends() {
    let failure = TierFailure::new("file#2", "cache-cleared", eyre!("disk full")).rewrap("memory#1");
    let text = failure.to_string();
    assert!(text.starts_with("memory#1 failed while handling error"));
    assert!(text.contains("raised by file#2 on cache-cleared"));
    assert!(text.contains("disk full"));
  }

  #[test]
  fn test_lock_held_message() {
    let err = CacheError::LockHeld {
      path: PathBuf::from("/tmp/rooms.cache.lock"),
    };
    assert_eq!(
      err.to_string(),
      "/tmp/rooms.cache.lock is locked by another holder"
    );
  }
}
