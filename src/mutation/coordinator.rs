//! Create / update / delete with optimistic patches, reconciliation and rollback.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, QueryData, Record, Tag};
use crate::error::SyncResult;
use crate::executor::QueryExecutor;
use crate::routes::Operation;
use crate::transport::HttpRequest;

use super::patch::{merge, record_id, OptimisticPatch};

struct Pending {
  generation: u64,
  patch: OptimisticPatch,
}

/// Outstanding optimistic patches per (entity, id), oldest first.
#[derive(Default)]
struct PendingTable {
  next_generation: u64,
  by_record: HashMap<(String, String), Vec<Pending>>,
  /// Newest generation per record whose server result has been applied
  confirmed: HashMap<(String, String), u64>,
}

impl PendingTable {
  fn push(&mut self, record: (String, String), patch: OptimisticPatch) -> u64 {
    self.next_generation += 1;
    let generation = self.next_generation;
    self
      .by_record
      .entry(record)
      .or_default()
      .push(Pending { generation, patch });
    generation
  }

  /// Remove `generation`, returning it with the pending mutations older and newer than it.
  fn take(
    &mut self,
    record: &(String, String),
    generation: u64,
  ) -> Option<(OptimisticPatch, &mut [Pending], &mut [Pending])> {
    let chain = self.by_record.get_mut(record)?;
    let at = chain.iter().position(|p| p.generation == generation)?;
    let own = chain.remove(at).patch;
    let (older, newer) = chain.split_at_mut(at);
    Some((own, older, newer))
  }

  fn prune(&mut self, record: &(String, String)) {
    if self.by_record.get(record).is_some_and(Vec::is_empty) {
      self.by_record.remove(record);
      self.confirmed.remove(record);
    }
  }

  /// Whether a newer mutation of `record` has already been confirmed.
  fn superseded(&self, record: &(String, String), generation: u64) -> bool {
    self.confirmed.get(record).is_some_and(|g| *g > generation)
  }

  fn confirm(&mut self, record: &(String, String), generation: u64) {
    let newest = self.confirmed.entry(record.clone()).or_default();
    *newest = (*newest).max(generation);
  }

  fn outstanding(&self) -> usize {
    self.by_record.values().map(Vec::len).sum()
  }
}

/// Executes mutations against the shared cache.
///
/// For a single (entity, id) the order optimistic patch, then reconciliation or
/// rollback, is preserved. A failure only rolls the cache back if it is the most
/// recent outstanding mutation for that record; otherwise its snapshot is handed
/// to the next newer one.
pub struct MutationCoordinator {
  executor: QueryExecutor,
  id_field: String,
  pending: Mutex<PendingTable>,
}

impl MutationCoordinator {
  pub fn new(executor: QueryExecutor, id_field: impl Into<String>) -> Self {
    Self {
      executor,
      id_field: id_field.into(),
      pending: Mutex::default(),
    }
  }

  fn pending(&self) -> MutexGuard<'_, PendingTable> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Number of mutations whose optimistic patch is still applied.
  pub fn outstanding(&self) -> usize {
    self.pending().outstanding()
  }

  /// Create a record. Nothing is inserted until the server assigns its identity.
  pub async fn create(&self, entity: &str, payload: Value) -> SyncResult<Record> {
    let descriptor = self.executor.resolve(entity)?;
    let route = descriptor.route(Operation::Create);
    let request = HttpRequest::new(route.method, route.path(None)).with_body(payload.clone());

    let envelope = match self.executor.guard().execute(request).await {
      Ok(envelope) => envelope,
      Err(e) => {
        self.executor.notifier().surface(&e);
        return Err(e);
      }
    };

    let created = if envelope.result.is_object() {
      envelope.result
    } else {
      payload
    };
    self.prepend_created(&descriptor.name, &created);
    info!(entity = %descriptor.name, "created record");
    self.invalidate(vec![Tag::Entity(descriptor.name.clone())]);
    Ok(created)
  }

  fn prepend_created(&self, entity: &str, created: &Record) {
    let store = self.executor.store();
    let id = record_id(created, &self.id_field);
    for key in store.keys_for(entity).into_iter().filter(CacheKey::is_list) {
      let limit = key.args().page_limit();
      store.modify(&key, |entry| {
        let QueryData::List(records) = &mut entry.result else {
          return;
        };
        if id.is_some() && records.iter().any(|r| record_id(r, &self.id_field) == id) {
          return;
        }
        records.insert(0, created.clone());
        let limit = match entry.pagination.as_mut() {
          Some(p) => {
            p.total += 1;
            Some(p.limit).filter(|l| *l > 0).or(limit)
          }
          None => limit,
        };
        if let Some(limit) = limit {
          records.truncate(limit as usize);
        }
      });
    }
  }

  /// Merge `patch` into every cached copy of `id` now; reconcile or roll back later.
  pub async fn update(&self, entity: &str, id: &str, patch: Value) -> SyncResult<Record> {
    let descriptor = self.executor.resolve(entity)?;
    let entity = descriptor.name.clone();
    let record = (entity.clone(), id.to_string());

    let generation = {
      let mut pending = self.pending();
      let optimistic =
        OptimisticPatch::apply_update(self.executor.store(), &entity, id, &patch, &self.id_field);
      debug!(entity = %entity, id, entries = optimistic.target_entry_keys.len(), "applied optimistic update");
      pending.push(record.clone(), optimistic)
    };

    let route = descriptor.route(Operation::Update);
    let request = HttpRequest::new(route.method, route.path(Some(id))).with_body(patch);
    let result = self.executor.guard().execute(request).await;

    match result {
      Ok(envelope) => {
        let server = envelope.result.is_object().then_some(envelope.result);
        let confirmed = self.reconcile(&record, generation, server.as_ref());
        self.invalidate(vec![Tag::Entity(entity.clone()), Tag::Record(entity, id.to_string())]);
        Ok(confirmed.unwrap_or(Value::Null))
      }
      Err(e) => {
        self.roll_back(&record, generation);
        self.executor.notifier().surface(&e);
        Err(e)
      }
    }
  }

  /// Remove `id` everywhere now; restore it exactly if the server refuses.
  pub async fn delete(&self, entity: &str, id: &str) -> SyncResult<Record> {
    let descriptor = self.executor.resolve(entity)?;
    let entity = descriptor.name.clone();
    let record = (entity.clone(), id.to_string());

    let generation = {
      let mut pending = self.pending();
      let optimistic =
        OptimisticPatch::apply_delete(self.executor.store(), &entity, id, &self.id_field);
      debug!(entity = %entity, id, entries = optimistic.target_entry_keys.len(), "applied optimistic delete");
      pending.push(record.clone(), optimistic)
    };

    let route = descriptor.route(Operation::Delete);
    let request = HttpRequest::new(route.method, route.path(Some(id)));
    let result = self.executor.guard().execute(request).await;

    match result {
      Ok(envelope) => {
        self.confirm_delete(&record, generation);
        self.invalidate(vec![Tag::Entity(entity.clone()), Tag::Record(entity, id.to_string())]);
        Ok(envelope.result)
      }
      Err(e) => {
        self.roll_back(&record, generation);
        self.executor.notifier().surface(&e);
        Err(e)
      }
    }
  }

  /// Replace the optimistic guess with the server record wherever it appears.
  ///
  /// Newer pending updates stay visible on top of the server record.
  fn reconcile(
    &self,
    record: &(String, String),
    generation: u64,
    server: Option<&Record>,
  ) -> Option<Record> {
    let mut pending = self.pending();
    if pending.superseded(record, generation) {
      pending.take(record, generation);
      pending.prune(record);
      debug!(entity = %record.0, id = %record.1, generation, "newer update already confirmed, keeping it");
      return server.cloned();
    }
    let Some((own, older, newer)) = pending.take(record, generation) else {
      warn!(entity = %record.0, id = %record.1, "reconciling an untracked mutation");
      return server.cloned();
    };

    let confirmed = match server {
      Some(server) => {
        let mut view = server.clone();
        for p in newer.iter() {
          merge(&mut view, &p.patch.forward_delta);
        }
        let touched = self.replace_record(&record.0, &record.1, &view);
        for p in newer.iter_mut() {
          p.patch.set_prior(server);
        }
        for p in older.iter_mut() {
          p.patch.forget(&touched);
        }
        Some(server.clone())
      }
      None => {
        for p in older.iter_mut() {
          p.patch.forget(&own.target_entry_keys);
        }
        self.current_record(&record.0, &record.1)
      }
    };

    pending.confirm(record, generation);
    pending.prune(record);
    debug!(entity = %record.0, id = %record.1, "reconciled update");
    confirmed
  }

  fn confirm_delete(&self, record: &(String, String), generation: u64) {
    let mut pending = self.pending();
    if let Some((own, older, _)) = pending.take(record, generation) {
      for p in older.iter_mut() {
        p.patch.forget(&own.target_entry_keys);
      }
    }
    pending.confirm(record, generation);
    pending.prune(record);
    debug!(entity = %record.0, id = %record.1, "confirmed delete");
  }

  /// Undo `generation` if it is the newest outstanding mutation for the record.
  fn roll_back(&self, record: &(String, String), generation: u64) {
    let store = self.executor.store();
    let mut pending = self.pending();
    let Some((own, _, newer)) = pending.take(record, generation) else {
      return;
    };

    match newer.first_mut() {
      None => {
        own.rollback(store, &self.id_field);
        info!(entity = %record.0, id = %record.1, "rolled back optimistic patch");
      }
      Some(next) => {
        let leftover = next.patch.rebase_onto(&own);
        leftover.rollback(store, &self.id_field);
        info!(
          entity = %record.0,
          id = %record.1,
          superseded_by = next.generation,
          "newer mutation pending, handed rollback snapshot forward"
        );
      }
    }
    pending.prune(record);
  }

  /// Write `view` over every cached copy of record `id`. Returns the touched keys.
  fn replace_record(&self, entity: &str, id: &str, view: &Record) -> Vec<CacheKey> {
    let store = self.executor.store();
    let mut touched = Vec::new();
    for key in store.keys_for(entity) {
      let replaced = if key.is_list() {
        let mut hit = false;
        store.modify(&key, |entry| {
          if let QueryData::List(records) = &mut entry.result {
            for r in records.iter_mut() {
              if record_id(r, &self.id_field).as_deref() == Some(id) {
                *r = view.clone();
                hit = true;
              }
            }
          }
        });
        hit
      } else if key.detail_id() == Some(id) {
        store.modify(&key, |entry| entry.result = QueryData::Record(view.clone()))
      } else {
        false
      };
      if replaced {
        touched.push(key);
      }
    }
    touched
  }

  fn current_record(&self, entity: &str, id: &str) -> Option<Record> {
    let store = self.executor.store();
    store.keys_for(entity).into_iter().find_map(|key| {
      let entry = store.get(&key)?;
      match entry.result {
        QueryData::Record(r) if key.detail_id() == Some(id) => Some(r),
        QueryData::List(records) => records
          .into_iter()
          .find(|r| record_id(r, &self.id_field).as_deref() == Some(id)),
        _ => None,
      }
    })
  }

  /// Mark tagged entries stale and refetch the ones someone is watching.
  fn invalidate(&self, tags: Vec<Tag>) {
    let active = self.executor.store().invalidate(&tags);
    if !active.is_empty() {
      self.executor.refetch_in_background(active);
    }
  }
}
