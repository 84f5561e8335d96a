//! Assembling tiers into a chain from a most-preferred-first list of kinds.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::events::CacheEvent;
use super::file::FileCachedValue;
use super::lock::LockOptions;
use super::memory::MemoryCachedValue;
use super::policy::ExpirationPolicy;
use super::source::CachedValueSource;
use super::traits::{Cacheable, Fetch};
use super::value::CachedValue;
use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
  Memory,
  File,
  Origin,
}

impl fmt::Display for TierKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Memory => "memory",
      Self::File => "file",
      Self::Origin => "origin",
    })
  }
}

/// Creates tiers for one cached entity.
pub trait TierFactory<T: Cacheable> {
  fn create(&self, kind: TierKind) -> Result<CachedValue<T>>;
}

/// Maps entity keys to stable, filesystem-safe cache file paths.
#[derive(Debug, Clone)]
pub struct FileNamer {
  dir: PathBuf,
}

impl FileNamer {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn path_for(&self, key: &str) -> PathBuf {
    // SHA256 hash for stable, fixed-length names
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    self
      .dir
      .join(format!("{}.cache", hex::encode(hasher.finalize())))
  }
}

/// Factory for an entity keyed by name: memory tiers, file tiers named by
/// [`FileNamer`], and origin tiers sharing one fetcher.
pub struct EntityTiers<T: Cacheable> {
  key: String,
  policy: Arc<ExpirationPolicy>,
  namer: FileNamer,
  lock_options: LockOptions,
  fetcher: Arc<dyn Fetch<T>>,
}

impl<T: Cacheable> EntityTiers<T> {
  pub fn new(
    key: impl Into<String>,
    policy: Arc<ExpirationPolicy>,
    namer: FileNamer,
    fetcher: Arc<dyn Fetch<T>>,
  ) -> Self {
    Self {
      key: key.into(),
      policy,
      namer,
      lock_options: LockOptions::default(),
      fetcher,
    }
  }

  pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
    self.lock_options = lock_options;
    self
  }
}

impl<T: Cacheable> TierFactory<T> for EntityTiers<T> {
  fn create(&self, kind: TierKind) -> Result<CachedValue<T>> {
    let name = format!("{}:{}", self.key, kind);
    let policy = Arc::clone(&self.policy);
    Ok(match kind {
      TierKind::Memory => CachedValue::named(name, MemoryCachedValue::new(), policy),
      TierKind::File => CachedValue::named(
        name,
        FileCachedValue::with_lock_options(self.namer.path_for(&self.key), self.lock_options),
        policy,
      ),
      TierKind::Origin => CachedValue::named(
        name,
        CachedValueSource::new(Arc::clone(&self.fetcher)),
        policy,
      ),
    })
  }
}

/// Tiers of one chain, head first.
pub struct Chain<T: Cacheable> {
  tiers: Vec<CachedValue<T>>,
}

impl<T: Cacheable> Chain<T> {
  /// Build from a most-preferred-first list of kinds.
  ///
  /// Tiers are created from the origin backward, each attached to the one built
  /// before it. Only the last kind may produce a tier that takes no source.
  pub async fn build(kinds: &[TierKind], factory: &impl TierFactory<T>) -> Result<Self> {
    if kinds.is_empty() {
      return Err(CacheError::InvalidChain("no tiers configured".to_string()).into());
    }

    let mut tiers = Vec::with_capacity(kinds.len());
    let mut previous: Option<CachedValue<T>> = None;
    for (position, kind) in kinds.iter().enumerate().rev() {
      let tier = factory.create(*kind)?;
      if let Some(source) = previous.take() {
        if !tier.capabilities().needs_source {
          return Err(
            CacheError::InvalidChain(format!(
              "{} tier at position {} cannot take a source; only the last tier may be an origin",
              kind, position
            ))
            .into(),
          );
        }
        tier.set_source(Some(source), false, false).await?;
      }
      debug!("Built {} at position {}", tier.name(), position);
      tiers.push(tier.clone());
      previous = Some(tier);
    }
    tiers.reverse();

    Ok(Self { tiers })
  }

  pub fn head(&self) -> &CachedValue<T> {
    &self.tiers[0]
  }

  pub fn tiers(&self) -> &[CachedValue<T>] {
    &self.tiers
  }

  /// Initialize from the origin toward the head so every tier can clamp to an
  /// already initialized source.
  pub async fn init(&self) -> Result<()> {
    for tier in self.tiers.iter().rev() {
      tier.init().await?;
    }
    Ok(())
  }

  pub async fn dispose(&self) -> Result<()> {
    for tier in &self.tiers {
      tier.dispose().await?;
    }
    Ok(())
  }

  /// Destroy every destroyable tier. Returns how many were destroyed.
  pub async fn destroy(&self) -> Result<usize> {
    let mut destroyed = 0;
    for tier in &self.tiers {
      if tier.destroy().await? {
        destroyed += 1;
      } else {
        tier.dispose().await?;
      }
    }
    Ok(destroyed)
  }

  /// Events from the head, including failures propagated from deeper tiers.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent<T>> {
    self.head().subscribe()
  }
}
