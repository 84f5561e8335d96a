//! Volatile tier holding the value for the lifetime of the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Mutex;

use super::events::lock;
use super::traits::{Cacheable, Capabilities, Loaded, TierStorage};

/// In-memory tier. Forgets everything on restart, so its persisted expiration is
/// always the ceiling.
pub struct MemoryCachedValue<T> {
  value: Mutex<Option<T>>,
}

impl<T> MemoryCachedValue<T> {
  pub fn new() -> Self {
    Self {
      value: Mutex::new(None),
    }
  }
}

impl<T> Default for MemoryCachedValue<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl<T: Cacheable> TierStorage<T> for MemoryCachedValue<T> {
  fn kind(&self) -> &'static str {
    "memory"
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities {
      needs_source: true,
      needs_init: true,
      destroyable: false,
    }
  }

  async fn load(&self) -> Result<Loaded<T>> {
    Ok(Loaded::new(lock(&self.value).clone(), None))
  }

  async fn save(&self, value: Option<&T>, _expiration: DateTime<Utc>) -> Result<()> {
    *lock(&self.value) = value.cloned();
    Ok(())
  }

  async fn clear(&self) -> Result<bool> {
    Ok(lock(&self.value).take().is_some())
  }
}
