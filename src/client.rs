//! Data client that wires routes, cache, session and mutations together.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStore, QueryArgs, Record};
use crate::config::Config;
use crate::error::SyncResult;
use crate::event::EventHandler;
use crate::executor::QueryExecutor;
use crate::mutation::MutationCoordinator;
use crate::query::QueryHandle;
use crate::routes::{DynamicInjector, EntityDescriptor, RouteRegistry};
use crate::session::{
  Classifier, GuardState, MemoryTokenStore, SessionGuard, SessionState, SqliteTokenStore,
  TokenStore,
};
use crate::transport::{ReqwestTransport, Transport};

/// How often the garbage collector sweeps for unused entries.
const GC_INTERVAL: Duration = Duration::from_secs(15);

/// Entry point for screens and the CLI.
///
/// One per process. Must be created inside a tokio runtime, since it starts the
/// cache collector and a watcher that clears the cache when the session ends.
pub struct DataClient {
  executor: QueryExecutor,
  mutations: MutationCoordinator,
  tasks: Vec<JoinHandle<()>>,
}

impl DataClient {
  /// Build a client talking to `config.api.base_url` over HTTP.
  ///
  /// Tokens persist in SQLite when a store path is known, in memory otherwise.
  pub fn new(config: &Config) -> SyncResult<(Self, EventHandler)> {
    let transport = Arc::new(ReqwestTransport::new(&config.api.base_url)?);
    let tokens: Arc<dyn TokenStore> = match config.token_store_path() {
      Some(path) => Arc::new(SqliteTokenStore::open(&path)?),
      None => Arc::new(MemoryTokenStore::default()),
    };
    Self::with_transport(config, transport, tokens)
  }

  pub fn with_transport(
    config: &Config,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenStore>,
  ) -> SyncResult<(Self, EventHandler)> {
    let (notifier, events) = EventHandler::new();

    let registry = Arc::new(RouteRegistry::new(config.entities.iter().cloned()));
    let injector = Arc::new(DynamicInjector::new(registry));
    let store = CacheStore::new();

    let classifier = Classifier::new(
      &config.permission_denied_patterns,
      config.unauthorized_statuses.clone(),
    );
    let guard = Arc::new(SessionGuard::new(
      transport,
      tokens,
      classifier,
      config.api.refresh_endpoint.clone(),
      notifier.clone(),
    )?);

    let gc_time = config.cache.gc_time();
    let gc_interval = GC_INTERVAL.min(gc_time).max(Duration::from_secs(1));
    let tasks = vec![
      store.spawn_gc(gc_interval, gc_time),
      spawn_logout_watcher(&guard, store.clone()),
    ];

    let executor = QueryExecutor::new(
      injector,
      store,
      guard,
      notifier,
      config.cache.stale_time(),
      config.paging.default_page_limit,
    );
    let mutations = MutationCoordinator::new(executor.clone(), config.id_field.clone());
    info!(base_url = %config.api.base_url, "data client ready");

    Ok((
      Self {
        executor,
        mutations,
        tasks,
      },
      events,
    ))
  }

  pub fn store(&self) -> &CacheStore {
    self.executor.store()
  }

  pub fn session_state(&self) -> GuardState {
    self.executor.guard().state()
  }

  pub fn session(&self) -> SessionState {
    self.executor.guard().session()
  }

  /// Routes for `entity`, injecting conventional ones if it is unknown.
  pub fn routes(&self, entity: &str) -> SyncResult<Arc<EntityDescriptor>> {
    self.executor.resolve(entity)
  }

  /// Subscribe to a page of `entity` and start loading it.
  pub fn list(&self, entity: &str, args: QueryArgs) -> SyncResult<QueryHandle> {
    let key = self.executor.list_key(entity, args)?;
    let mut handle = QueryHandle::new(self.executor.clone(), key);
    handle.fetch();
    Ok(handle)
  }

  /// Subscribe to one record of `entity` and start loading it.
  pub fn by_id(&self, entity: &str, id: &str) -> SyncResult<QueryHandle> {
    let key = self.executor.detail_key(entity, id, &QueryArgs::new())?;
    let mut handle = QueryHandle::new(self.executor.clone(), key);
    handle.fetch();
    Ok(handle)
  }

  /// One-shot list read, served from cache while fresh.
  pub async fn fetch_list(&self, entity: &str, args: QueryArgs) -> SyncResult<CacheEntry> {
    Ok(self.executor.list(entity, args, false).await?.data)
  }

  /// One-shot detail read, served from cache while fresh.
  pub async fn fetch_by_id(&self, entity: &str, id: &str) -> SyncResult<CacheEntry> {
    Ok(self.executor.by_id(entity, id, &QueryArgs::new(), false).await?.data)
  }

  pub async fn create(&self, entity: &str, payload: Value) -> SyncResult<Record> {
    self.mutations.create(entity, payload).await
  }

  pub async fn update(&self, entity: &str, id: &str, patch: Value) -> SyncResult<Record> {
    self.mutations.update(entity, id, patch).await
  }

  pub async fn delete(&self, entity: &str, id: &str) -> SyncResult<Record> {
    self.mutations.delete(entity, id).await
  }

  pub fn login(&self, session: SessionState) -> SyncResult<()> {
    self.executor.guard().login(session)
  }

  /// End the session and drop every cached entry.
  pub fn logout(&self) -> SyncResult<()> {
    let result = self.executor.guard().logout();
    self.executor.store().reset();
    result
  }
}

impl Drop for DataClient {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

/// Reset the cache whenever the session ends, including forced logouts.
fn spawn_logout_watcher(guard: &SessionGuard, store: CacheStore) -> JoinHandle<()> {
  let mut state = guard.subscribe_state();
  tokio::spawn(async move {
    while state.changed().await.is_ok() {
      if *state.borrow_and_update() == GuardState::LoggedOut {
        debug!("session ended, clearing cache");
        store.reset();
      }
    }
  })
}
