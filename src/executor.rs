//! Query executor: cache-first reads with single-flight network fetches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{
  CacheEntry, CacheKey, CacheResult, CacheStore, Pagination, QueryArgs, QueryData, QueryKind,
};
use crate::error::{SyncError, SyncResult};
use crate::event::Notifier;
use crate::routes::{DynamicInjector, EntityDescriptor, Operation};
use crate::session::SessionGuard;
use crate::transport::{ApiEnvelope, HttpRequest};

type SharedFetch = Shared<BoxFuture<'static, SyncResult<CacheEntry>>>;

struct ExecutorInner {
  injector: Arc<DynamicInjector>,
  store: CacheStore,
  guard: Arc<SessionGuard>,
  notifier: Notifier,
  /// How long a fetched entry is served without hitting the network
  stale_time: Duration,
  default_page_limit: u64,
  /// Flight id, cache epoch the read started at, shared result
  in_flight: Mutex<HashMap<CacheKey, (u64, u64, SharedFetch)>>,
  next_flight: AtomicU64,
}

/// Issues list/detail reads and owns the network side of the cache.
#[derive(Clone)]
pub struct QueryExecutor {
  inner: Arc<ExecutorInner>,
}

impl QueryExecutor {
  pub fn new(
    injector: Arc<DynamicInjector>,
    store: CacheStore,
    guard: Arc<SessionGuard>,
    notifier: Notifier,
    stale_time: Duration,
    default_page_limit: u64,
  ) -> Self {
    Self {
      inner: Arc::new(ExecutorInner {
        injector,
        store,
        guard,
        notifier,
        stale_time,
        default_page_limit,
        in_flight: Mutex::default(),
        next_flight: AtomicU64::new(0),
      }),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  pub fn guard(&self) -> &Arc<SessionGuard> {
    &self.inner.guard
  }

  pub fn notifier(&self) -> &Notifier {
    &self.inner.notifier
  }

  /// Resolve `entity`, injecting conventional routes for unknown names.
  pub fn resolve(&self, entity: &str) -> SyncResult<Arc<EntityDescriptor>> {
    self.inner.injector.resolve(entity)
  }

  /// Cache key for a list query, with paging defaults applied.
  pub fn list_key(&self, entity: &str, args: QueryArgs) -> SyncResult<CacheKey> {
    let descriptor = self.resolve(entity)?;
    let args = args.with_list_defaults(self.inner.default_page_limit);
    Ok(CacheKey::list(
      &descriptor.name,
      &descriptor.routes.list.identifier,
      &args,
    ))
  }

  pub fn detail_key(&self, entity: &str, id: &str, args: &QueryArgs) -> SyncResult<CacheKey> {
    let descriptor = self.resolve(entity)?;
    Ok(CacheKey::detail(
      &descriptor.name,
      &descriptor.routes.get.identifier,
      id,
      args,
    ))
  }

  pub async fn list(
    &self,
    entity: &str,
    args: QueryArgs,
    force: bool,
  ) -> SyncResult<CacheResult<CacheEntry>> {
    let key = self.list_key(entity, args)?;
    self.fetch(key, force).await
  }

  pub async fn by_id(
    &self,
    entity: &str,
    id: &str,
    args: &QueryArgs,
    force: bool,
  ) -> SyncResult<CacheResult<CacheEntry>> {
    let key = self.detail_key(entity, id, args)?;
    self.fetch(key, force).await
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Unless forced, return a fresh cached entry immediately
  /// 2. Join an identical in-flight request started since the entry last changed
  /// 3. Otherwise start a network request and share it
  pub async fn fetch(&self, key: CacheKey, force: bool) -> SyncResult<CacheResult<CacheEntry>> {
    let store = &self.inner.store;
    if !force && store.is_fresh(&key, self.inner.stale_time) {
      if let Some(entry) = store.get(&key) {
        let cached_at = entry.last_fetched_at;
        return Ok(CacheResult::from_cache(entry, cached_at));
      }
    }

    let (flight, joined) = {
      let mut in_flight = self
        .inner
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      let epoch = store.begin_fetch(&key);
      match in_flight.get(&key) {
        Some((_, started, flight)) if *started == epoch => (flight.clone(), true),
        _ => {
          let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
          let flight = self.start(key.clone(), id, epoch);
          in_flight.insert(key.clone(), (id, epoch, flight.clone()));
          (flight, false)
        }
      }
    };

    if joined {
      debug!(key = %key, "joining in-flight request");
    }
    let entry = flight.await?;
    let cached_at = entry.last_fetched_at;
    Ok(if joined {
      CacheResult::joined(entry, cached_at)
    } else {
      CacheResult::from_network(entry, cached_at)
    })
  }

  /// Spawn the network read so it completes even if every caller goes away.
  fn start(&self, key: CacheKey, id: u64, epoch: u64) -> SharedFetch {
    let inner = Arc::clone(&self.inner);
    let handle = tokio::spawn(async move {
      let result = inner.load(&key, epoch).await;
      let mut in_flight = inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
      if in_flight.get(&key).is_some_and(|(current, _, _)| *current == id) {
        in_flight.remove(&key);
      }
      result
    });

    async move {
      handle
        .await
        .unwrap_or_else(|e| Err(SyncError::Network(format!("request task failed: {e}"))))
    }
    .boxed()
    .shared()
  }

  /// Refetch `keys` in the background.
  pub fn refetch_in_background(&self, keys: Vec<CacheKey>) {
    for key in keys {
      let executor = self.clone();
      tokio::spawn(async move {
        if let Err(e) = executor.fetch(key.clone(), true).await {
          warn!(key = %key, error = %e, "background refetch failed");
        }
      });
    }
  }
}

impl ExecutorInner {
  /// Run the read and cache its result unless the entry changed meanwhile.
  async fn load(&self, key: &CacheKey, epoch: u64) -> SyncResult<CacheEntry> {
    let result = self.request(key).await;
    match result {
      Ok(entry) => {
        if self.store.write_fetched(key, entry.clone(), epoch) {
          return Ok(entry);
        }
        debug!(key = %key, "entry changed during fetch, keeping cached data");
        Ok(self.store.get(key).unwrap_or(entry))
      }
      Err(e) => {
        self.notifier.surface(&e);
        Err(e)
      }
    }
  }

  async fn request(&self, key: &CacheKey) -> SyncResult<CacheEntry> {
    let descriptor = self.injector.registry().get_routes(&key.entity)?;
    let args = key.args();
    let request = match &key.kind {
      QueryKind::List => {
        let route = descriptor.route(Operation::List);
        HttpRequest::new(route.method, route.path(None)).with_args(args.to_json())
      }
      QueryKind::Detail { id } => {
        let route = descriptor.route(Operation::Get);
        HttpRequest::new(route.method, route.path(Some(id))).with_args(args.to_json())
      }
    };

    debug!(key = %key, hash = %key.cache_hash(), "fetching");
    let envelope = self.guard.execute(request).await?;
    entry_from_envelope(key, &args, envelope)
  }
}

fn entry_from_envelope(
  key: &CacheKey,
  args: &QueryArgs,
  envelope: ApiEnvelope,
) -> SyncResult<CacheEntry> {
  match &key.kind {
    QueryKind::List => {
      let records = match envelope.result {
        Value::Array(records) => records,
        Value::Null => Vec::new(),
        other => {
          return Err(SyncError::Decode(format!(
            "expected a list for {}, got {}",
            key.identifier, other
          )))
        }
      };
      let pagination = envelope.pagination.unwrap_or_else(|| Pagination {
        page: args.page_number().unwrap_or(1),
        limit: args.page_limit().unwrap_or(records.len() as u64),
        total: records.len() as u64,
      });
      Ok(CacheEntry::new(
        key.serialized_args.clone(),
        QueryData::List(records),
        Some(pagination),
      ))
    }
    QueryKind::Detail { .. } => Ok(CacheEntry::new(
      key.serialized_args.clone(),
      QueryData::Record(envelope.result),
      envelope.pagination,
    )),
  }
}
