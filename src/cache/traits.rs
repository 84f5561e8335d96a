//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Trait for values that can be cached.
///
/// Durable tiers persist values as JSON, so everything cached must round-trip
/// through serde.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Per-kind capability flags, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
  /// Tier stores values locally and pulls from a source on miss.
  pub needs_source: bool,
  /// Tier must be initialized before use.
  pub needs_init: bool,
  /// Tier owns persisted state that `destroy` can delete.
  pub destroyable: bool,
}

/// Result of reading a tier's storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
  /// `None` means the tier holds nothing.
  pub value: Option<T>,
  /// Expiration stored alongside the value, if the tier persists one.
  pub expiration: Option<DateTime<Utc>>,
}

impl<T> Loaded<T> {
  pub fn new(value: Option<T>, expiration: Option<DateTime<Utc>>) -> Self {
    Self { value, expiration }
  }

  pub fn absent() -> Self {
    Self {
      value: None,
      expiration: None,
    }
  }
}

/// Expiration metadata a durable tier recovers on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persisted {
  pub expiration: DateTime<Utc>,
  pub has_value: bool,
}

/// Storage hooks behind a [`CachedValue`](super::CachedValue).
///
/// The cached value drives lifecycle, expiration bookkeeping and chaining;
/// implementors only move bytes in and out of their backing store.
#[async_trait]
pub trait TierStorage<T: Cacheable>: Send + Sync + 'static {
  /// Short kind name used in logs and error annotations (e.g. "file").
  fn kind(&self) -> &'static str;

  fn capabilities(&self) -> Capabilities;

  /// Acquire resources. `ceiling` is the expiration to write into fresh storage.
  async fn init(&self, _ceiling: DateTime<Utc>) -> Result<()> {
    Ok(())
  }

  /// Read whatever the tier holds. For origin tiers this is the external fetch.
  async fn load(&self) -> Result<Loaded<T>>;

  /// Expiration persisted by a previous process, if any.
  async fn load_expiration(&self) -> Result<Option<Persisted>> {
    Ok(None)
  }

  async fn save(&self, value: Option<&T>, expiration: DateTime<Utc>) -> Result<()>;

  /// Persist a new expiration without touching the stored value.
  async fn save_expiration(&self, _expiration: DateTime<Utc>) -> Result<()> {
    Ok(())
  }

  /// Drop the stored value. Returns `false` if there was nothing to drop.
  async fn clear(&self) -> Result<bool>;

  /// Release resources acquired by `init`. Must be idempotent.
  async fn dispose(&self) -> Result<()> {
    Ok(())
  }

  /// Delete persisted state. Called after `dispose`.
  async fn destroy(&self) -> Result<()> {
    Ok(())
  }
}

/// External fetch performed by an origin tier.
#[async_trait]
pub trait Fetch<T: Cacheable>: Send + Sync + 'static {
  /// Fetch the current value. A `None` expiration defers to the chain's ceiling.
  async fn fetch(&self) -> Result<Loaded<T>>;
}

#[async_trait]
impl<T, F> Fetch<T> for Arc<F>
where
  T: Cacheable,
  F: Fetch<T> + ?Sized,
{
  async fn fetch(&self) -> Result<Loaded<T>> {
    (**self).fetch().await
  }
}

/// [`Fetch`] backed by an async closure.
pub struct FetchFn<F>(F);

/// Wrap an async closure as a fetcher.
pub fn fetch_fn<T, F, Fut>(f: F) -> FetchFn<F>
where
  T: Cacheable,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Loaded<T>>> + Send + 'static,
{
  FetchFn(f)
}

#[async_trait]
impl<T, F, Fut> Fetch<T> for FetchFn<F>
where
  T: Cacheable,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Loaded<T>>> + Send + 'static,
{
  async fn fetch(&self) -> Result<Loaded<T>> {
    (self.0)().await
  }
}
