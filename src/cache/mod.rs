//! Chainable, expiring value cache.
//!
//! A chain is a list of tiers (memory, file, origin) linked head to origin.
//! Loads start at the head and fall through to the source on miss or expiry;
//! values and expirations ripple back toward the head. No tier may claim an
//! expiration later than its source's or the daily ceiling from
//! [`ExpirationPolicy`].

mod chain;
mod events;
mod file;
mod lock;
mod memory;
mod policy;
mod source;
mod traits;
mod value;

pub use chain::{Chain, EntityTiers, FileNamer, TierFactory, TierKind};
pub use events::{CacheEvent, TierId};
pub use file::FileCachedValue;
pub use lock::{FileLock, LockOptions};
pub use memory::MemoryCachedValue;
pub use policy::ExpirationPolicy;
pub use source::CachedValueSource;
pub use traits::{fetch_fn, Cacheable, Capabilities, Fetch, FetchFn, Loaded, Persisted, TierStorage};
pub use value::CachedValue;
