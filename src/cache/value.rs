//! The cached value handle: lifecycle, expiration bookkeeping and chaining.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::WrapErr, Result};
use futures::future::{BoxFuture, FutureExt};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{lock, CacheEvent, ListenerId, Listeners, TierId};
use super::policy::ExpirationPolicy;
use super::traits::{Cacheable, Capabilities, TierStorage};
use crate::error::{CacheError, TierFailure};

/// One tier of a cache chain.
///
/// Cheap to clone; clones share the same tier. A tier may be the source of
/// several independent chains.
pub struct CachedValue<T: Cacheable> {
  inner: Arc<Inner<T>>,
}

impl<T: Cacheable> Clone for CachedValue<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

struct Inner<T: Cacheable> {
  id: TierId,
  name: String,
  storage: Box<dyn TierStorage<T>>,
  capabilities: Capabilities,
  policy: Arc<ExpirationPolicy>,
  state: Mutex<State>,
  source: Mutex<Option<Attachment<T>>>,
  listeners: Listeners<T>,
  /// Serializes init/dispose/destroy.
  lifecycle: tokio::sync::Mutex<()>,
  jobs: Mutex<Option<mpsc::UnboundedSender<Job<T>>>>,
  timer: Mutex<Option<JoinHandle<()>>>,
}

struct State {
  expiration: DateTime<Utc>,
  initialized: bool,
  holds_value: bool,
}

struct Attachment<T: Cacheable> {
  tier: CachedValue<T>,
  listener: ListenerId,
}

enum Job<T> {
  Source(CacheEvent<T>),
  Expire,
  Flush(oneshot::Sender<()>),
}

impl<T: Cacheable> CachedValue<T> {
  pub fn new(storage: impl TierStorage<T>, policy: Arc<ExpirationPolicy>) -> Self {
    let id = TierId::next();
    let name = format!("{}#{}", storage.kind(), id);
    Self::build(id, name, Box::new(storage), policy)
  }

  pub fn named(
    name: impl Into<String>,
    storage: impl TierStorage<T>,
    policy: Arc<ExpirationPolicy>,
  ) -> Self {
    Self::build(TierId::next(), name.into(), Box::new(storage), policy)
  }

  fn build(
    id: TierId,
    name: String,
    storage: Box<dyn TierStorage<T>>,
    policy: Arc<ExpirationPolicy>,
  ) -> Self {
    let capabilities = storage.capabilities();
    let expiration = policy.ceiling_now();
    Self {
      inner: Arc::new(Inner {
        id,
        name,
        storage,
        capabilities,
        policy,
        state: Mutex::new(State {
          expiration,
          initialized: !capabilities.needs_init,
          holds_value: false,
        }),
        source: Mutex::new(None),
        listeners: Listeners::new(),
        lifecycle: tokio::sync::Mutex::new(()),
        jobs: Mutex::new(None),
        timer: Mutex::new(None),
      }),
    }
  }

  pub fn id(&self) -> TierId {
    self.inner.id
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn kind(&self) -> &'static str {
    self.inner.storage.kind()
  }

  pub fn capabilities(&self) -> Capabilities {
    self.inner.capabilities
  }

  pub fn policy(&self) -> &ExpirationPolicy {
    &self.inner.policy
  }

  pub fn is_initialized(&self) -> bool {
    lock(&self.inner.state).initialized
  }

  /// Current expiration, never later than the source's.
  pub fn expiration(&self) -> DateTime<Utc> {
    let stored = lock(&self.inner.state).expiration;
    match self.source() {
      Some(source) => ExpirationPolicy::clamp(stored, source.expiration()),
      None => stored,
    }
  }

  pub fn source(&self) -> Option<CachedValue<T>> {
    lock(&self.inner.source)
      .as_ref()
      .map(|attachment| attachment.tier.clone())
  }

  pub fn ptr_eq(&self, other: &CachedValue<T>) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Receive every event this tier emits from now on.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent<T>> {
    self.inner.listeners.subscribe()
  }

  /// Acquire storage resources and recover the persisted expiration.
  ///
  /// Returns `false` if there was nothing to do.
  pub async fn init(&self) -> Result<bool> {
    let _guard = self.inner.lifecycle.lock().await;
    if self.is_initialized() {
      return Ok(false);
    }

    let ceiling = self.upper_bound();
    self
      .inner
      .storage
      .init(ceiling)
      .await
      .wrap_err_with(|| format!("{} failed to initialize", self.name()))?;

    let persisted = match self.inner.storage.load_expiration().await {
      Ok(persisted) => persisted,
      Err(e) => {
        // Release what storage.init acquired; the tier stays uninitialized.
        if let Err(dispose_err) = self.inner.storage.dispose().await {
          warn!("{} failed to release storage: {:#}", self.name(), dispose_err);
        }
        return Err(e.wrap_err(format!("{} failed to load its expiration", self.name())));
      }
    };

    let (expiration, holds_value) = match persisted {
      Some(persisted) => (self.clamp(persisted.expiration), persisted.has_value),
      None => (ceiling, false),
    };
    lock(&self.inner.state).initialized = true;
    self.commit(expiration, holds_value);

    info!("Initialized {} (expires {})", self.name(), expiration);
    Ok(true)
  }

  /// Load the value, falling through to the source on miss or expiry.
  pub async fn load_value(&self) -> Result<Option<T>> {
    self.load_value_with_requesters(Vec::new()).await
  }

  /// Load on behalf of `requesters`, the tiers downstream whose own loads are
  /// waiting on this one.
  pub fn load_value_with_requesters(
    &self,
    requesters: Vec<TierId>,
  ) -> BoxFuture<'_, Result<Option<T>>> {
    async move {
      self.ensure_initialized()?;

      if !self.inner.capabilities.needs_source {
        return self.fetch(requesters).await;
      }

      let local = self.read_local().await?;
      if local.is_some() && self.expiration() > Utc::now() {
        return Ok(local);
      }

      let Some(source) = self.source() else {
        return Ok(local);
      };

      debug!("{} missed, loading from {}", self.name(), source.name());
      let mut requesters = requesters;
      requesters.push(self.id());
      let value = source
        .load_value_with_requesters(requesters.clone())
        .await?;

      let expiration = self.clamp(source.expiration());
      self
        .inner
        .storage
        .save(value.as_ref(), expiration)
        .await
        .wrap_err_with(|| format!("{} failed to save value", self.name()))?;
      self.settle(value.clone(), expiration, requesters);
      Ok(value)
    }
    .boxed()
  }

  /// Read local storage only, never consulting the source.
  pub async fn load_from_cache(&self) -> Result<Option<T>> {
    self.ensure_initialized()?;
    self.read_local().await
  }

  /// Attach `source` (or detach with `None`).
  ///
  /// Returns `false` if `source` is already attached.
  pub async fn set_source(
    &self,
    source: Option<CachedValue<T>>,
    clear_on_detach: bool,
    load_now: bool,
  ) -> Result<bool> {
    if !self.inner.capabilities.needs_source {
      return Err(
        CacheError::SourceNotAccepted {
          tier: self.name().to_string(),
        }
        .into(),
      );
    }

    let current = self.source();
    let unchanged = match (&current, &source) {
      (Some(a), Some(b)) => a.ptr_eq(b),
      (None, None) => true,
      _ => false,
    };
    if unchanged {
      return Ok(false);
    }

    let old = lock(&self.inner.source).take();
    let old_id = old.as_ref().map(|attachment| attachment.tier.id());
    if let Some(old) = old {
      old.tier.inner.listeners.remove(old.listener);
      if clear_on_detach && self.is_initialized() {
        self.clear_cache().await?;
      }
    }

    let new_id = source.as_ref().map(CachedValue::id);
    if let Some(tier) = source {
      let jobs = self.inner.worker();
      let listener = tier.inner.listeners.add(Box::new(move |event| match event {
        CacheEvent::Updated { .. } | CacheEvent::Cleared | CacheEvent::Error(_) => {
          jobs.send(Job::Source(event.clone())).is_ok()
        }
        CacheEvent::SourceChanged { .. } => !jobs.is_closed(),
      }));
      *lock(&self.inner.source) = Some(Attachment { tier, listener });

      if self.is_initialized() {
        let state = self.snapshot();
        self.commit(self.clamp(state.0), state.1);
      }
      if load_now {
        self.load_value().await?;
      }
    }

    debug!("{} source changed to {:?}", self.name(), new_id);
    self.emit(CacheEvent::SourceChanged {
      new: new_id,
      old: old_id,
    });
    Ok(true)
  }

  /// Drop the local value. Returns `false` if there was nothing to drop.
  pub async fn clear_cache(&self) -> Result<bool> {
    self.ensure_initialized()?;
    let cleared = self
      .inner
      .storage
      .clear()
      .await
      .wrap_err_with(|| format!("{} failed to clear", self.name()))?;
    if !cleared {
      return Ok(false);
    }

    let expiration = self.upper_bound();
    self.commit(expiration, false);
    debug!("Cleared {}", self.name());
    self.emit(CacheEvent::Cleared);
    Ok(true)
  }

  /// Set a new expiration. It may not exceed the ceiling nor the source's.
  pub async fn set_expiration(&self, expiration: DateTime<Utc>) -> Result<()> {
    self.ensure_initialized()?;
    let now = Utc::now();
    self.inner.policy.assert_valid(expiration, now)?;
    if let Some(source) = self.source() {
      let source_expiration = source.expiration();
      if expiration > source_expiration {
        return Err(
          CacheError::ExpirationBeyondSource {
            expiration,
            source_expiration,
          }
          .into(),
        );
      }
    }

    if self.expiration() <= now {
      self.clear_cache().await?;
    }

    self
      .inner
      .storage
      .save_expiration(expiration)
      .await
      .wrap_err_with(|| format!("{} failed to save expiration", self.name()))?;
    let holds_value = self.snapshot().1;
    self.commit(expiration, holds_value);
    Ok(())
  }

  /// Release resources. The tier can be initialized again afterwards.
  pub async fn dispose(&self) -> Result<bool> {
    let _guard = self.inner.lifecycle.lock().await;
    self.dispose_locked().await
  }

  /// Dispose and delete persisted state. Returns `false` for tiers without
  /// anything to destroy.
  ///
  /// Only an initialized tier holds the storage lock, so only an initialized
  /// tier may destroy.
  pub async fn destroy(&self) -> Result<bool> {
    if !self.inner.capabilities.destroyable {
      return Ok(false);
    }
    let _guard = self.inner.lifecycle.lock().await;
    self.ensure_initialized()?;
    self.dispose_locked().await?;
    self
      .inner
      .storage
      .destroy()
      .await
      .wrap_err_with(|| format!("{} failed to destroy", self.name()))?;
    info!("Destroyed {}", self.name());
    Ok(true)
  }

  /// Wait until background work queued so far has been applied.
  pub async fn drain(&self) {
    let jobs = lock(&self.inner.jobs).clone();
    let Some(jobs) = jobs else {
      return;
    };
    let (done, wait) = oneshot::channel();
    if jobs.send(Job::Flush(done)).is_ok() {
      let _ = wait.await;
    }
  }

  async fn dispose_locked(&self) -> Result<bool> {
    self.drain().await;
    if !self.inner.capabilities.needs_init || !self.is_initialized() {
      return Ok(false);
    }

    self.inner.cancel_timer();
    self
      .inner
      .storage
      .dispose()
      .await
      .wrap_err_with(|| format!("{} failed to dispose", self.name()))?;
    lock(&self.inner.state).initialized = false;
    info!("Disposed {}", self.name());
    Ok(true)
  }

  /// Origin load: the storage read is the external fetch.
  async fn fetch(&self, requesters: Vec<TierId>) -> Result<Option<T>> {
    debug!("{} fetching", self.name());
    let loaded = self
      .inner
      .storage
      .load()
      .await
      .wrap_err_with(|| format!("{} failed to fetch", self.name()))?;
    let expiration = self.clamp(loaded.expiration.unwrap_or_else(|| self.upper_bound()));
    self.settle(loaded.value.clone(), expiration, requesters);
    Ok(loaded.value)
  }

  async fn read_local(&self) -> Result<Option<T>> {
    let loaded = self
      .inner
      .storage
      .load()
      .await
      .wrap_err_with(|| format!("{} failed to load from cache", self.name()))?;
    let expiration = self.clamp(loaded.expiration.unwrap_or_else(|| self.expiration()));
    self.commit(expiration, loaded.value.is_some());
    Ok(loaded.value)
  }

  /// Commit a freshly stored value and announce it.
  fn settle(&self, value: Option<T>, expiration: DateTime<Utc>, requesters: Vec<TierId>) {
    let previous = self.expiration();
    self.commit(expiration, value.is_some());
    if expiration < previous && expiration <= Utc::now() {
      debug!("{} stored an already expired value, not announcing", self.name());
      return;
    }
    self.emit(CacheEvent::Updated {
      value,
      expiration,
      requesters,
    });
  }

  /// Persist a value pushed by the source.
  async fn store_pushed(
    &self,
    value: Option<T>,
    expiration: DateTime<Utc>,
    requesters: Vec<TierId>,
  ) -> Result<()> {
    let expiration = self.clamp(expiration);
    self
      .inner
      .storage
      .save(value.as_ref(), expiration)
      .await
      .wrap_err_with(|| format!("{} failed to save value", self.name()))?;
    self.settle(value, expiration, requesters);
    Ok(())
  }

  async fn react(&self, event: CacheEvent<T>) {
    if !self.is_initialized() {
      debug!("{} ignoring {} while not initialized", self.name(), event.name());
      return;
    }

    let name = event.name();
    let outcome = match event {
      CacheEvent::Updated {
        value,
        expiration,
        requesters,
      } => {
        if requesters.contains(&self.id()) {
          return;
        }
        self.store_pushed(value, expiration, requesters).await
      }
      CacheEvent::Cleared => self.clear_cache().await.map(|_| ()),
      CacheEvent::Error(failure) => {
        self.emit(CacheEvent::Error(failure.rewrap(self.name())));
        return;
      }
      CacheEvent::SourceChanged { .. } => return,
    };

    if let Err(e) = outcome {
      self.report(name, e);
    }
  }

  fn report(&self, event: &'static str, error: color_eyre::eyre::Report) {
    let failure = TierFailure::new(self.name(), event, error);
    warn!("{}", failure);
    self.emit(CacheEvent::Error(failure));
  }

  fn emit(&self, event: CacheEvent<T>) {
    self.inner.listeners.emit(&event);
  }

  fn ensure_initialized(&self) -> Result<()> {
    if self.is_initialized() {
      Ok(())
    } else {
      Err(
        CacheError::NotInitialized {
          tier: self.name().to_string(),
        }
        .into(),
      )
    }
  }

  fn snapshot(&self) -> (DateTime<Utc>, bool) {
    let state = lock(&self.inner.state);
    (state.expiration, state.holds_value)
  }

  /// Latest expiration this tier may claim right now.
  fn upper_bound(&self) -> DateTime<Utc> {
    let ceiling = self.inner.policy.ceiling_now();
    match self.source() {
      Some(source) => ExpirationPolicy::clamp(ceiling, source.expiration()),
      None => ceiling,
    }
  }

  fn clamp(&self, expiration: DateTime<Utc>) -> DateTime<Utc> {
    ExpirationPolicy::clamp(expiration, self.upper_bound())
  }

  fn commit(&self, expiration: DateTime<Utc>, holds_value: bool) {
    {
      let mut state = lock(&self.inner.state);
      state.expiration = expiration;
      state.holds_value = holds_value;
    }
    self.inner.rearm_timer();
  }
}

impl<T: Cacheable> Inner<T> {
  /// Background queue applying source reactions and expiry in receipt order.
  fn worker(self: &Arc<Self>) -> mpsc::UnboundedSender<Job<T>> {
    let mut jobs = lock(&self.jobs);
    if let Some(tx) = jobs.as_ref().filter(|tx| !tx.is_closed()) {
      return tx.clone();
    }
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(Arc::downgrade(self), rx));
    *jobs = Some(tx.clone());
    tx
  }

  fn rearm_timer(self: &Arc<Self>) {
    self.cancel_timer();
    let (expiration, armed) = {
      let state = lock(&self.state);
      let armed = state.holds_value && state.initialized && self.capabilities.needs_source;
      (state.expiration, armed)
    };
    if !armed {
      return;
    }
    let Ok(delay) = (expiration - Utc::now()).to_std() else {
      return;
    };

    let jobs = self.worker();
    *lock(&self.timer) = Some(tokio::spawn(async move {
      // Fire strictly after the expiration so the worker sees it as passed.
      tokio::time::sleep(delay + std::time::Duration::from_millis(1)).await;
      let _ = jobs.send(Job::Expire);
    }));
  }

  fn cancel_timer(&self) {
    if let Some(timer) = lock(&self.timer).take() {
      timer.abort();
    }
  }
}

impl<T: Cacheable> Drop for Inner<T> {
  fn drop(&mut self) {
    self.cancel_timer();
    if let Some(attachment) = lock(&self.source).take() {
      attachment.tier.inner.listeners.remove(attachment.listener);
    }
  }
}

async fn run_worker<T: Cacheable>(tier: Weak<Inner<T>>, mut jobs: mpsc::UnboundedReceiver<Job<T>>) {
  while let Some(job) = jobs.recv().await {
    let Some(inner) = tier.upgrade() else {
      break;
    };
    let tier = CachedValue { inner };
    match job {
      Job::Flush(done) => {
        let _ = done.send(());
      }
      Job::Expire => {
        // A refresh may have landed after the timer fired.
        if !tier.is_initialized() || tier.expiration() > Utc::now() {
          continue;
        }
        debug!("{} expired", tier.name());
        if let Err(e) = tier.clear_cache().await {
          tier.report("expiry", e);
        }
      }
      Job::Source(event) => tier.react(event).await,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::file::FileCachedValue;
  use crate::cache::lock::{FileLock, LockOptions};
  use crate::cache::memory::MemoryCachedValue;
  use crate::cache::source::CachedValueSource;
  use crate::cache::traits::{fetch_fn, Loaded};
  use async_trait::async_trait;
  use chrono::{Duration, FixedOffset, Timelike};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration as StdDuration;

  /// Cutoff about twelve hours ahead, so the ceiling never rolls over mid-test.
  fn policy() -> Arc<ExpirationPolicy> {
    let cutoff = Utc::now() + Duration::hours(12);
    Arc::new(
      ExpirationPolicy::new(
        cutoff.hour(),
        cutoff.minute(),
        FixedOffset::east_opt(0).unwrap(),
      )
      .unwrap(),
    )
  }

  fn origin(
    policy: &Arc<ExpirationPolicy>,
    calls: &Arc<AtomicUsize>,
    expiration: Option<DateTime<Utc>>,
  ) -> CachedValue<String> {
    let calls = Arc::clone(calls);
    CachedValue::named(
      "rooms:origin",
      CachedValueSource::new(fetch_fn(move || {
        let calls = Arc::clone(&calls);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(Loaded::new(Some("rooms-payload".to_string()), expiration))
        }
      })),
      Arc::clone(policy),
    )
  }

  async fn memory_over(
    policy: &Arc<ExpirationPolicy>,
    source: &CachedValue<String>,
  ) -> CachedValue<String> {
    let tier = CachedValue::new(MemoryCachedValue::new(), Arc::clone(policy));
    tier
      .set_source(Some(source.clone()), false, false)
      .await
      .unwrap();
    tier.init().await.unwrap();
    tier
  }

  fn config_error(err: &color_eyre::eyre::Report) -> Option<&CacheError> {
    err.downcast_ref::<CacheError>()
  }

  /// Tier whose writes always fail.
  struct Broken;

  #[async_trait]
  impl TierStorage<String> for Broken {
    fn kind(&self) -> &'static str {
      "broken"
    }

    fn capabilities(&self) -> Capabilities {
      Capabilities {
        needs_source: true,
        needs_init: false,
        destroyable: false,
      }
    }

    async fn load(&self) -> Result<Loaded<String>> {
      Ok(Loaded::absent())
    }

    async fn save(&self, _value: Option<&String>, _expiration: DateTime<Utc>) -> Result<()> {
      Err(eyre!("disk full"))
    }

    async fn clear(&self) -> Result<bool> {
      Ok(false)
    }
  }

  /// Tier that records when its lifecycle hooks start and finish.
  struct Recording {
    log: Arc<Mutex<Vec<&'static str>>>,
  }

  #[async_trait]
  impl TierStorage<String> for Recording {
    fn kind(&self) -> &'static str {
      "recording"
    }

    fn capabilities(&self) -> Capabilities {
      Capabilities {
        needs_source: true,
        needs_init: true,
        destroyable: true,
      }
    }

    async fn init(&self, _ceiling: DateTime<Utc>) -> Result<()> {
      lock(&self.log).push("init");
      tokio::time::sleep(StdDuration::from_millis(30)).await;
      lock(&self.log).push("init done");
      Ok(())
    }

    async fn load(&self) -> Result<Loaded<String>> {
      Ok(Loaded::absent())
    }

    async fn save(&self, _value: Option<&String>, _expiration: DateTime<Utc>) -> Result<()> {
      Ok(())
    }

    async fn clear(&self) -> Result<bool> {
      Ok(false)
    }

    async fn dispose(&self) -> Result<()> {
      lock(&self.log).push("dispose");
      tokio::time::sleep(StdDuration::from_millis(30)).await;
      lock(&self.log).push("dispose done");
      Ok(())
    }

    async fn destroy(&self) -> Result<()> {
      lock(&self.log).push("destroy");
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_operations_require_init() {
    let policy = policy();
    let tier: CachedValue<String> = CachedValue::new(MemoryCachedValue::new(), policy);

    assert!(!tier.is_initialized());
    let err = tier.load_value().await.unwrap_err();
    assert!(matches!(
      config_error(&err),
      Some(CacheError::NotInitialized { .. })
    ));
    assert!(tier.clear_cache().await.is_err());
    assert!(tier.set_expiration(Utc::now()).await.is_err());

    assert!(tier.init().await.unwrap());
    assert!(!tier.init().await.unwrap());
    assert!(tier.is_initialized());
    assert_eq!(tier.load_value().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_origin_is_ready_and_takes_no_source() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let other = origin.clone();

    assert!(origin.is_initialized());
    assert!(!origin.init().await.unwrap());
    let err = origin.set_source(Some(other), false, false).await.unwrap_err();
    assert!(matches!(
      config_error(&err),
      Some(CacheError::SourceNotAccepted { .. })
    ));
    assert!(!origin.dispose().await.unwrap());
    assert!(!origin.destroy().await.unwrap());
    assert!(origin.is_initialized());
  }

  #[tokio::test]
  async fn test_load_falls_through_once() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let head = memory_over(&policy, &origin).await;

    assert_eq!(head.load_value().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(head.load_value().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(head.expiration() <= origin.expiration());
    assert!(origin.expiration() <= policy.ceiling_now());
    assert!(head.expiration() > Utc::now());
  }

  #[tokio::test]
  async fn test_shared_origin_echo_is_persisted_once() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let a = memory_over(&policy, &origin).await;
    let b = memory_over(&policy, &origin).await;

    assert_eq!(a.load_value().await.unwrap().as_deref(), Some("rooms-payload"));
    a.drain().await;
    b.drain().await;

    assert_eq!(b.load_from_cache().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(b.load_value().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(b.expiration(), origin.expiration());
  }

  #[tokio::test]
  async fn test_expired_update_is_not_announced() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, Some(Utc::now() - Duration::hours(1)));
    let mut events = origin.subscribe();

    origin.load_value().await.unwrap();
    assert!(events.try_recv().is_err());
    assert!(origin.expiration() < Utc::now());
  }

  #[tokio::test]
  async fn test_clear_resets_expiration_to_source() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let head = memory_over(&policy, &origin).await;

    head.load_value().await.unwrap();
    head
      .set_expiration(Utc::now() + Duration::hours(1))
      .await
      .unwrap();
    assert!(head.expiration() < origin.expiration());
    let mut events = head.subscribe();

    assert!(head.clear_cache().await.unwrap());
    assert_eq!(head.expiration(), origin.expiration());
    assert!(matches!(events.recv().await, Some(CacheEvent::Cleared)));
    assert!(!head.clear_cache().await.unwrap());
  }

  #[tokio::test]
  async fn test_source_clear_cascades() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let middle = memory_over(&policy, &origin).await;
    let head = memory_over(&policy, &middle).await;

    head.load_value().await.unwrap();
    assert!(middle.clear_cache().await.unwrap());
    head.drain().await;

    assert_eq!(head.load_from_cache().await.unwrap(), None);
    assert_eq!(head.load_value().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_set_expiration_is_bounded() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, Some(Utc::now() + Duration::hours(2)));
    let head = memory_over(&policy, &origin).await;
    head.load_value().await.unwrap();

    let err = head
      .set_expiration(policy.ceiling_now() + Duration::minutes(1))
      .await
      .unwrap_err();
    assert!(matches!(
      config_error(&err),
      Some(CacheError::ExpirationBeyondCeiling { .. })
    ));

    let err = head
      .set_expiration(origin.expiration() + Duration::minutes(1))
      .await
      .unwrap_err();
    assert!(matches!(
      config_error(&err),
      Some(CacheError::ExpirationBeyondSource { .. })
    ));

    let earlier = Utc::now() + Duration::minutes(30);
    head.set_expiration(earlier).await.unwrap();
    assert_eq!(head.expiration(), earlier);
  }

  #[tokio::test]
  async fn test_expiry_timer_clears_value() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let head = memory_over(&policy, &origin).await;

    head.load_value().await.unwrap();
    let mut events = head.subscribe();
    head
      .set_expiration(Utc::now() + Duration::milliseconds(150))
      .await
      .unwrap();

    tokio::time::sleep(StdDuration::from_millis(400)).await;
    head.drain().await;

    assert!(matches!(events.recv().await, Some(CacheEvent::Cleared)));
    assert_eq!(head.load_from_cache().await.unwrap(), None);
    assert_eq!(head.expiration(), origin.expiration());
  }

  #[tokio::test]
  async fn test_reaction_failure_travels_down_the_chain() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let broken = CachedValue::named("rooms:broken", Broken, Arc::clone(&policy));
    broken
      .set_source(Some(origin.clone()), false, false)
      .await
      .unwrap();
    let head = memory_over(&policy, &broken).await;
    let mut events = head.subscribe();

    let requester = memory_over(&policy, &origin).await;
    requester.load_value().await.unwrap();
    broken.drain().await;
    head.drain().await;

    match events.recv().await {
      Some(CacheEvent::Error(failure)) => {
        assert_eq!(failure.tier(), head.name());
        assert_eq!(failure.origin_tier(), "rooms:broken");
        assert_eq!(failure.event, "error");
        assert_eq!(failure.origin_event, "cache-updated");
        assert!(failure.to_string().contains("disk full"));
      }
      other => panic!("expected error event, got {:?}", other.map(|e| e.name())),
    }
  }

  #[tokio::test]
  async fn test_set_source_lifecycle() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let first = origin(&policy, &calls, None);
    let second = origin(&policy, &calls, None);
    let head = memory_over(&policy, &first).await;

    assert!(!head
      .set_source(Some(first.clone()), false, false)
      .await
      .unwrap());

    head.load_value().await.unwrap();
    let mut events = head.subscribe();
    assert!(head
      .set_source(Some(second.clone()), true, false)
      .await
      .unwrap());
    assert!(matches!(events.recv().await, Some(CacheEvent::Cleared)));
    match events.recv().await {
      Some(CacheEvent::SourceChanged { new, old }) => {
        assert_eq!(new, Some(second.id()));
        assert_eq!(old, Some(first.id()));
      }
      other => panic!("expected source change, got {:?}", other.map(|e| e.name())),
    }
    assert!(head.source().unwrap().ptr_eq(&second));
    assert_eq!(head.load_from_cache().await.unwrap(), None);

    assert!(head.set_source(None, false, false).await.unwrap());
    assert!(head.source().is_none());
    assert_eq!(head.load_value().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_set_source_prefetches() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let head: CachedValue<String> = CachedValue::new(MemoryCachedValue::new(), Arc::clone(&policy));
    head.init().await.unwrap();

    head.set_source(Some(origin), false, true).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(head.load_from_cache().await.unwrap().as_deref(), Some("rooms-payload"));
  }

  #[tokio::test]
  async fn test_destroy_respects_capability() {
    let policy = policy();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rooms.cache");

    let memory: CachedValue<String> = CachedValue::new(MemoryCachedValue::new(), Arc::clone(&policy));
    memory.init().await.unwrap();
    assert!(!memory.destroy().await.unwrap());
    assert!(memory.is_initialized());

    let file: CachedValue<String> = CachedValue::new(
      FileCachedValue::with_lock_options(&path, LockOptions::default()),
      Arc::clone(&policy),
    );
    file.init().await.unwrap();
    assert!(path.exists());
    assert!(file.destroy().await.unwrap());
    assert!(!path.exists());
    assert!(!file.is_initialized());
  }

  #[tokio::test]
  async fn test_file_chain_scenario() {
    let policy = policy();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rooms.cache");
    let calls = Arc::new(AtomicUsize::new(0));
    let expiration = Utc::now() + Duration::hours(3);
    let origin = origin(&policy, &calls, Some(expiration));

    let head: CachedValue<String> = CachedValue::named(
      "rooms:file",
      FileCachedValue::new(&path),
      Arc::clone(&policy),
    );
    head.set_source(Some(origin.clone()), false, false).await.unwrap();
    head.init().await.unwrap();

    assert_eq!(head.load_value().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(head.load_value().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(head.expiration(), expiration);
    assert!(head.dispose().await.unwrap());
    assert!(!head.dispose().await.unwrap());

    let reopened: CachedValue<String> = CachedValue::named(
      "rooms:file",
      FileCachedValue::new(&path),
      Arc::clone(&policy),
    );
    reopened
      .set_source(Some(origin.clone()), false, false)
      .await
      .unwrap();
    reopened.init().await.unwrap();
    assert_eq!(reopened.expiration(), expiration);
    assert_eq!(
      reopened.load_from_cache().await.unwrap().as_deref(),
      Some("rooms-payload")
    );
    assert_eq!(reopened.load_value().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    reopened.dispose().await.unwrap();
  }

  #[tokio::test]
  async fn test_failed_init_releases_lock() {
    let policy = policy();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rooms.cache");
    std::fs::write(&path, b"not a timestamp at all\n[]").unwrap();

    let tier: CachedValue<String> = CachedValue::new(FileCachedValue::new(&path), Arc::clone(&policy));
    let err = tier.init().await.unwrap_err();
    assert!(err.to_string().contains("failed to load its expiration"));
    assert!(!tier.is_initialized());
    assert!(!FileLock::path_for(&path).exists());

    std::fs::write(&path, b"2024-01-02T03:00:00Z\n").unwrap();
    let other: CachedValue<String> = CachedValue::new(FileCachedValue::new(&path), Arc::clone(&policy));
    assert!(other.init().await.unwrap());
    other.dispose().await.unwrap();
  }

  #[tokio::test]
  async fn test_uninitialized_tier_cannot_destroy() {
    let policy = policy();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rooms.cache");

    let holder: CachedValue<String> = CachedValue::new(FileCachedValue::new(&path), Arc::clone(&policy));
    holder.init().await.unwrap();
    holder
      .inner
      .storage
      .save(Some(&"rooms-payload".to_string()), holder.expiration())
      .await
      .unwrap();

    let stranger: CachedValue<String> = CachedValue::new(FileCachedValue::new(&path), Arc::clone(&policy));
    let err = stranger.destroy().await.unwrap_err();
    assert!(matches!(
      config_error(&err),
      Some(CacheError::NotInitialized { .. })
    ));
    assert!(path.exists());
    assert_eq!(
      holder.load_from_cache().await.unwrap().as_deref(),
      Some("rooms-payload")
    );
    holder.dispose().await.unwrap();
  }

  #[tokio::test]
  async fn test_lifecycle_hooks_never_interleave() {
    let policy = policy();
    let log = Arc::new(Mutex::new(Vec::new()));
    let tier: CachedValue<String> = CachedValue::new(
      Recording {
        log: Arc::clone(&log),
      },
      policy,
    );

    let (init, dispose, again) = tokio::join!(tier.init(), tier.dispose(), tier.init());
    assert!(init.unwrap());
    assert!(dispose.unwrap());
    assert!(again.unwrap());
    assert!(tier.destroy().await.unwrap());

    assert_eq!(
      *lock(&log),
      vec![
        "init",
        "init done",
        "dispose",
        "dispose done",
        "init",
        "init done",
        "dispose",
        "dispose done",
        "destroy",
      ]
    );
  }

  #[tokio::test]
  async fn test_dispose_applies_queued_reactions_first() {
    let policy = policy();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rooms.cache");
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);

    let file: CachedValue<String> = CachedValue::named(
      "rooms:file",
      FileCachedValue::new(&path),
      Arc::clone(&policy),
    );
    file.set_source(Some(origin.clone()), false, false).await.unwrap();
    file.init().await.unwrap();
    let mut events = file.subscribe();

    // Queues an update on the file tier without waiting for it.
    let requester = memory_over(&policy, &origin).await;
    requester.load_value().await.unwrap();
    assert!(file.dispose().await.unwrap());

    match events.try_recv() {
      Ok(CacheEvent::Updated { value, .. }) => assert_eq!(value.as_deref(), Some("rooms-payload")),
      other => panic!("expected update, got {:?}", other.map(|e| e.name())),
    }
    assert!(events.try_recv().is_err());

    let reopened: CachedValue<String> = CachedValue::new(FileCachedValue::new(&path), Arc::clone(&policy));
    reopened.init().await.unwrap();
    assert_eq!(
      reopened.load_from_cache().await.unwrap().as_deref(),
      Some("rooms-payload")
    );
    reopened.dispose().await.unwrap();
  }

  #[tokio::test]
  async fn test_source_events_apply_in_order() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let middle = memory_over(&policy, &origin).await;
    let head = memory_over(&policy, &middle).await;
    let mut events = head.subscribe();

    middle.load_value().await.unwrap();
    assert!(middle.clear_cache().await.unwrap());
    middle.load_value().await.unwrap();
    head.drain().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event.name());
    }
    assert_eq!(seen, vec!["cache-updated", "cache-cleared", "cache-updated"]);
    assert_eq!(head.load_from_cache().await.unwrap().as_deref(), Some("rooms-payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_stale_expire_job_keeps_fresh_value() {
    let policy = policy();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = origin(&policy, &calls, None);
    let head = memory_over(&policy, &origin).await;
    head.load_value().await.unwrap();
    let mut events = head.subscribe();

    // An expiry that raced a refresh arrives after the value is fresh again.
    assert!(head.inner.worker().send(Job::Expire).is_ok());
    head.drain().await;

    assert!(events.try_recv().is_err());
    assert_eq!(head.load_from_cache().await.unwrap().as_deref(), Some("rooms-payload"));
  }
}
