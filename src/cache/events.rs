//! Lifecycle events and the listener registry each tier owns.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::error::TierFailure;

/// Process-unique identity of a tier, used in requester sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TierId(u64);

impl TierId {
  pub(crate) fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    Self(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl std::fmt::Display for TierId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Events emitted by a tier.
#[derive(Debug, Clone)]
pub enum CacheEvent<T> {
  /// The tier stored a new value (or learned the value is absent).
  ///
  /// `requesters` lists the tiers whose own load triggered this update; they
  /// have already persisted the value and ignore the echo.
  Updated {
    value: Option<T>,
    expiration: DateTime<Utc>,
    requesters: Vec<TierId>,
  },
  Cleared,
  SourceChanged {
    new: Option<TierId>,
    old: Option<TierId>,
  },
  Error(TierFailure),
}

impl<T> CacheEvent<T> {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Updated { .. } => "cache-updated",
      Self::Cleared => "cache-cleared",
      Self::SourceChanged { .. } => "source-changed",
      Self::Error(_) => "error",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListenerId(u64);

/// Returns `false` once the listener is gone and should be dropped.
pub(crate) type Listener<T> = Box<dyn Fn(&CacheEvent<T>) -> bool + Send + Sync>;

/// Observers registered on a tier.
pub(crate) struct Listeners<T> {
  next_id: AtomicU64,
  entries: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T: Clone + Send + 'static> Listeners<T> {
  pub(crate) fn new() -> Self {
    Self {
      next_id: AtomicU64::new(0),
      entries: Mutex::new(Vec::new()),
    }
  }

  pub(crate) fn add(&self, listener: Listener<T>) -> ListenerId {
    let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
    lock(&self.entries).push((id, listener));
    id
  }

  pub(crate) fn remove(&self, id: ListenerId) -> bool {
    let mut entries = lock(&self.entries);
    let before = entries.len();
    entries.retain(|(entry, _)| *entry != id);
    entries.len() != before
  }

  /// Deliver an event to every listener, in registration order.
  pub(crate) fn emit(&self, event: &CacheEvent<T>) {
    lock(&self.entries).retain(|(_, listener)| listener(event));
  }

  /// Channel receiving every event from now on.
  pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent<T>> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.add(Box::new(move |event| tx.send(event.clone()).is_ok()));
    rx
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    lock(&self.entries).len()
  }
}

/// Listeners only forward into channels, so a poisoned lock still holds
/// consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
