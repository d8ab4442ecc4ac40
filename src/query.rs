//! Subscribable query handles for the UI layer.
//!
//! A [`QueryHandle`] is the `{data, isLoading, error, refetch}` shape a screen
//! depends on. Data always comes from the shared cache, so optimistic patches
//! and reconciliations show up without refetching.
//!
//! # Example
//!
//! ```ignore
//! let mut products = client.list("Product", QueryArgs::page(1, 20))?;
//!
//! // In event loop tick
//! if products.poll() {
//!     // State or cached data changed, trigger re-render
//! }
//!
//! // In render
//! let snapshot = products.snapshot();
//! if snapshot.is_loading { render_spinner() }
//! ```

use tokio::sync::mpsc;

use crate::cache::{CacheEntry, CacheKey, QueryData, Subscription};
use crate::error::{SyncError, SyncResult};
use crate::executor::QueryExecutor;

/// Fetch status of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState {
  /// Query has not been started
  Idle,
  /// A fetch is outstanding
  Loading,
  /// Last fetch completed successfully
  Success,
  /// Last fetch failed
  Error(SyncError),
}

/// Plain copy of a query's current state.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
  pub data: Option<QueryData>,
  pub is_loading: bool,
  pub error: Option<SyncError>,
}

/// Live query bound to one cache entry.
///
/// Holding the handle keeps the entry subscribed, which protects it from eviction.
pub struct QueryHandle {
  executor: QueryExecutor,
  subscription: Subscription,
  state: QueryState,
  receiver: Option<mpsc::UnboundedReceiver<SyncResult<()>>>,
}

impl QueryHandle {
  pub(crate) fn new(executor: QueryExecutor, key: CacheKey) -> Self {
    let subscription = executor.store().subscribe(&key);
    Self {
      executor,
      subscription,
      state: QueryState::Idle,
      receiver: None,
    }
  }

  pub fn key(&self) -> &CacheKey {
    self.subscription.key()
  }

  pub fn state(&self) -> &QueryState {
    &self.state
  }

  pub fn entry(&self) -> Option<CacheEntry> {
    self.subscription.current()
  }

  pub fn data(&self) -> Option<QueryData> {
    self.entry().map(|e| e.result)
  }

  pub fn is_loading(&self) -> bool {
    matches!(self.state, QueryState::Loading)
  }

  pub fn error(&self) -> Option<&SyncError> {
    match &self.state {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }

  pub fn snapshot(&self) -> QuerySnapshot {
    QuerySnapshot {
      data: self.data(),
      is_loading: self.is_loading(),
      error: self.error().cloned(),
    }
  }

  /// Start fetching unless already loading. Fresh cache short-circuits the network.
  pub fn fetch(&mut self) {
    if self.is_loading() {
      return;
    }
    self.start(false);
  }

  /// Force a network read, even if data is fresh or a fetch is outstanding.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start(true);
  }

  /// Poll for completed fetches and cache writes.
  ///
  /// Returns `true` if anything visible changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    if let Some(receiver) = &mut self.receiver {
      match receiver.try_recv() {
        Ok(result) => {
          self.state = match result {
            Ok(()) => QueryState::Success,
            Err(e) => QueryState::Error(e),
          };
          self.receiver = None;
          changed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => {}
        Err(mpsc::error::TryRecvError::Disconnected) => {
          self.state = QueryState::Error(SyncError::Network("query task ended".to_string()));
          self.receiver = None;
          changed = true;
        }
      }
    }

    if self.subscription.has_changed() {
      self.subscription.mark_seen();
      changed = true;
    }

    changed
  }

  /// Wait for the outstanding fetch, if any, and return the settled snapshot.
  pub async fn settle(&mut self) -> QuerySnapshot {
    if let Some(mut receiver) = self.receiver.take() {
      self.state = match receiver.recv().await {
        Some(Ok(())) => QueryState::Success,
        Some(Err(e)) => QueryState::Error(e),
        None => QueryState::Error(SyncError::Network("query task ended".to_string())),
      };
    }
    self.subscription.mark_seen();
    self.snapshot()
  }

  fn start(&mut self, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let executor = self.executor.clone();
    let key = self.key().clone();
    tokio::spawn(async move {
      let result = executor.fetch(key, force).await.map(|_| ());
      // Ignore send errors - the handle may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl std::fmt::Debug for QueryHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryHandle")
      .field("key", self.key())
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
