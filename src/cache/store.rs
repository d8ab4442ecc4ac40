//! In-memory normalized result cache with subscriptions and idle eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::traits::{CacheEntry, CacheKey, Tag};

struct Slot {
  tx: watch::Sender<Option<CacheEntry>>,
  /// Marked by tag invalidation; cleared by the next write
  invalidated: bool,
  /// When the last subscriber went away
  idle_since: Option<Instant>,
  /// Bumped by every change that did not come from a network read
  epoch: u64,
}

impl Slot {
  fn new(epoch: u64) -> Self {
    let (tx, _) = watch::channel(None);
    Self {
      tx,
      invalidated: false,
      idle_since: Some(Instant::now()),
      epoch,
    }
  }

  fn snapshot(&self) -> Option<CacheEntry> {
    self.tx.borrow().clone().map(|mut entry| {
      entry.subscriber_count = self.tx.receiver_count();
      entry
    })
  }
}

#[derive(Default)]
struct StoreInner {
  slots: HashMap<CacheKey, Slot>,
  clock: u64,
  /// Clock value of the last reset
  reset_at: u64,
}

impl StoreInner {
  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  fn slot(&mut self, key: &CacheKey) -> &mut Slot {
    let epoch = self.tick();
    self.slots.entry(key.clone()).or_insert_with(|| Slot::new(epoch))
  }
}

/// The shared result cache.
///
/// Every operation is synchronous and never held across an await point.
/// Subscribers observe a write as soon as the writing call returns.
#[derive(Clone, Default)]
pub struct CacheStore {
  inner: Arc<Mutex<StoreInner>>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, StoreInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.lock().slots.get(key).and_then(Slot::snapshot)
  }

  /// Replace the entry for `key` and notify subscribers.
  pub fn write(&self, key: &CacheKey, mut entry: CacheEntry) {
    let mut inner = self.lock();
    let epoch = inner.tick();
    let slot = inner.slot(key);
    entry.subscriber_count = 0;
    slot.invalidated = false;
    slot.epoch = epoch;
    slot.tx.send_replace(Some(entry));
    trace!(key = %key, "cache write");
  }

  /// Start a network read of `key`. The returned epoch goes to [`CacheStore::write_fetched`].
  pub fn begin_fetch(&self, key: &CacheKey) -> u64 {
    self.lock().slot(key).epoch
  }

  /// Store a network result unless `key` changed after the read began.
  ///
  /// Returns false when the result was discarded.
  pub fn write_fetched(&self, key: &CacheKey, mut entry: CacheEntry, epoch: u64) -> bool {
    let mut inner = self.lock();
    match inner.slots.get(key).map(|slot| slot.epoch) {
      Some(current) if current != epoch => return false,
      None if epoch <= inner.reset_at => return false,
      _ => {}
    }
    let slot = inner.slots.entry(key.clone()).or_insert_with(|| Slot::new(epoch));
    entry.subscriber_count = 0;
    slot.invalidated = false;
    slot.tx.send_replace(Some(entry));
    trace!(key = %key, epoch, "cache write from network");
    true
  }

  /// Mutate an existing entry in place. Returns false when there is nothing cached.
  pub fn modify(&self, key: &CacheKey, f: impl FnOnce(&mut CacheEntry)) -> bool {
    let mut inner = self.lock();
    let epoch = inner.tick();
    let Some(slot) = inner.slots.get_mut(key) else {
      return false;
    };
    let modified = slot.tx.send_if_modified(|value| match value {
      Some(entry) => {
        f(entry);
        true
      }
      None => false,
    });
    if modified {
      slot.epoch = epoch;
    }
    modified
  }

  /// Drop the cached data for `key`, returning it. Subscribers see `None`.
  pub fn clear(&self, key: &CacheKey) -> Option<CacheEntry> {
    let mut inner = self.lock();
    let epoch = inner.tick();
    let slot = inner.slots.get_mut(key)?;
    slot.epoch = epoch;
    slot.tx.send_replace(None)
  }

  /// Put back a previously read entry (or absence) exactly as it was.
  ///
  /// Unlike [`CacheStore::write`] this leaves the invalidation flag alone.
  pub fn restore(&self, key: &CacheKey, entry: Option<CacheEntry>) {
    let mut inner = self.lock();
    let epoch = inner.tick();
    match entry {
      Some(mut entry) => {
        entry.subscriber_count = 0;
        let slot = inner.slot(key);
        slot.epoch = epoch;
        slot.tx.send_replace(Some(entry));
      }
      None => {
        if let Some(slot) = inner.slots.get_mut(key) {
          slot.epoch = epoch;
          slot.tx.send_replace(None);
        }
      }
    }
  }

  /// Every key cached for `entity`, in a stable order.
  pub fn keys_for(&self, entity: &str) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self
      .lock()
      .slots
      .iter()
      .filter(|(key, slot)| key.entity == entity && slot.tx.borrow().is_some())
      .map(|(key, _)| key.clone())
      .collect();
    keys.sort();
    keys
  }

  /// Subscribe to `key`, creating an empty slot if needed.
  pub fn subscribe(&self, key: &CacheKey) -> Subscription {
    let mut inner = self.lock();
    let slot = inner.slot(key);
    slot.idle_since = None;
    Subscription {
      key: key.clone(),
      rx: slot.tx.subscribe(),
      store: Arc::downgrade(&self.inner),
    }
  }

  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self
      .lock()
      .slots
      .get(key)
      .map(|s| s.tx.receiver_count())
      .unwrap_or(0)
  }

  /// Whether `key` holds data fetched within `stale_time` and not invalidated since.
  pub fn is_fresh(&self, key: &CacheKey, stale_time: Duration) -> bool {
    let inner = self.lock();
    let Some(slot) = inner.slots.get(key) else {
      return false;
    };
    if slot.invalidated {
      return false;
    }
    let fetched_at = match slot.tx.borrow().as_ref() {
      Some(entry) => entry.last_fetched_at,
      None => return false,
    };
    let stale_time = chrono::Duration::from_std(stale_time).unwrap_or(chrono::Duration::MAX);
    Utc::now() - fetched_at < stale_time
  }

  /// Mark every entry providing one of `tags` as stale.
  ///
  /// Returns the keys that currently have subscribers and should be refetched.
  pub fn invalidate(&self, tags: &[Tag]) -> Vec<CacheKey> {
    let mut inner = self.lock();
    let epoch = inner.tick();
    let mut active = Vec::new();
    for (key, slot) in inner.slots.iter_mut() {
      if !key.tags().iter().any(|t| tags.contains(t)) {
        continue;
      }
      slot.invalidated = true;
      slot.epoch = epoch;
      if slot.tx.receiver_count() > 0 {
        active.push(key.clone());
      }
    }
    active.sort();
    debug!(?tags, refetch = active.len(), "invalidated tags");
    active
  }

  /// Evict entries that have had no subscriber for at least `gc_time`.
  pub fn collect_garbage(&self, gc_time: Duration) -> usize {
    let mut inner = self.lock();
    let now = Instant::now();
    let before = inner.slots.len();
    inner.slots.retain(|key, slot| {
      if slot.tx.receiver_count() > 0 {
        slot.idle_since = None;
        return true;
      }
      match slot.idle_since {
        Some(since) if now.duration_since(since) >= gc_time => {
          debug!(key = %key, "evicting unused entry");
          false
        }
        Some(_) => true,
        None => {
          slot.idle_since = Some(now);
          true
        }
      }
    });
    before - inner.slots.len()
  }

  /// Sweep unused entries every `interval` until the store is dropped.
  pub fn spawn_gc(&self, interval: Duration, gc_time: Duration) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        CacheStore { inner }.collect_garbage(gc_time);
      }
    })
  }

  /// Drop all cached data. Subscribers stay attached and see `None`.
  pub fn reset(&self) {
    let mut inner = self.lock();
    let epoch = inner.tick();
    inner.reset_at = epoch;
    inner.slots.retain(|_, slot| {
      slot.tx.send_replace(None);
      slot.invalidated = false;
      slot.epoch = epoch;
      slot.tx.receiver_count() > 0
    });
    debug!("cache reset");
  }

  pub fn len(&self) -> usize {
    self
      .lock()
      .slots
      .values()
      .filter(|s| s.tx.borrow().is_some())
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// A live view onto one cache entry. Dropping it releases the subscription.
pub struct Subscription {
  key: CacheKey,
  rx: watch::Receiver<Option<CacheEntry>>,
  store: Weak<Mutex<StoreInner>>,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn current(&self) -> Option<CacheEntry> {
    self.rx.borrow().clone()
  }

  /// True when a write happened since the last [`Subscription::mark_seen`].
  pub fn has_changed(&self) -> bool {
    self.rx.has_changed().unwrap_or(false)
  }

  pub fn mark_seen(&mut self) {
    self.rx.mark_unchanged();
  }

  /// Wait for the next write.
  pub async fn changed(&mut self) -> Option<CacheEntry> {
    self.rx.changed().await.ok()?;
    self.rx.borrow_and_update().clone()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let Some(inner) = self.store.upgrade() else {
      return;
    };
    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(slot) = inner.slots.get_mut(&self.key) {
      // This receiver is still counted until the drop completes
      if slot.tx.receiver_count() <= 1 {
        slot.idle_since = Some(Instant::now());
      }
    }
  }
}
