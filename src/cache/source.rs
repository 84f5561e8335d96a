//! Origin tier: every load is a fetch from the external system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;

use super::traits::{Cacheable, Capabilities, Fetch, Loaded, TierStorage};

/// Leaf of a chain. Holds nothing, needs no initialization, and can't be
/// destroyed.
pub struct CachedValueSource<T> {
  fetcher: Box<dyn Fetch<T>>,
}

impl<T: Cacheable> CachedValueSource<T> {
  pub fn new(fetcher: impl Fetch<T>) -> Self {
    Self {
      fetcher: Box::new(fetcher),
    }
  }
}

#[async_trait]
impl<T: Cacheable> TierStorage<T> for CachedValueSource<T> {
  fn kind(&self) -> &'static str {
    "origin"
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities {
      needs_source: false,
      needs_init: false,
      destroyable: false,
    }
  }

  async fn load(&self) -> Result<Loaded<T>> {
    self.fetcher.fetch().await
  }

  async fn save(&self, _value: Option<&T>, _expiration: DateTime<Utc>) -> Result<()> {
    Ok(())
  }

  async fn clear(&self) -> Result<bool> {
    Ok(false)
  }
}
