//! Reversible optimistic deltas against cache entries.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::trace;

use crate::cache::{CacheEntry, CacheKey, CacheStore, QueryData, Record};

/// The id of `record` under `id_field`, numbers rendered as strings.
pub fn record_id(record: &Record, id_field: &str) -> Option<String> {
  match record.get(id_field)? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Shallow merge of `patch`'s top-level fields into `record`.
pub fn merge(record: &mut Record, patch: &Value) {
  let (Some(target), Some(fields)) = (record.as_object_mut(), patch.as_object()) else {
    return;
  };
  for (k, v) in fields {
    target.insert(k.clone(), v.clone());
  }
}

fn position(records: &[Record], id: &str, id_field: &str) -> Option<usize> {
  records
    .iter()
    .position(|r| record_id(r, id_field).as_deref() == Some(id))
}

/// How to undo one change to one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum InverseOp {
  /// Put `record` back in place of the list record with the same id
  RestoreListRecord {
    key: CacheKey,
    index: usize,
    record: Record,
  },
  /// Re-insert a removed record at its old position
  ReinsertListRecord {
    key: CacheKey,
    index: usize,
    record: Record,
    total_decremented: bool,
  },
  /// Put a detail entry back as it was
  RestoreDetail {
    key: CacheKey,
    entry: Option<CacheEntry>,
  },
}

impl InverseOp {
  pub fn key(&self) -> &CacheKey {
    match self {
      InverseOp::RestoreListRecord { key, .. }
      | InverseOp::ReinsertListRecord { key, .. }
      | InverseOp::RestoreDetail { key, .. } => key,
    }
  }

  /// Replace the pre-mutation snapshot this op restores.
  fn set_prior(&mut self, prior: &Record) {
    match self {
      InverseOp::RestoreListRecord { record, .. } | InverseOp::ReinsertListRecord { record, .. } => {
        *record = prior.clone();
      }
      InverseOp::RestoreDetail { entry, .. } => {
        if let Some(entry) = entry {
          entry.result = QueryData::Record(prior.clone());
        }
      }
    }
  }

  /// Take over `older`'s snapshot when both touch the same entry.
  fn adopt(&mut self, older: &InverseOp) {
    match (self, older) {
      (
        InverseOp::RestoreListRecord { record, .. } | InverseOp::ReinsertListRecord { record, .. },
        InverseOp::RestoreListRecord { record: prior, .. },
      ) => *record = prior.clone(),
      (InverseOp::RestoreDetail { entry, .. }, InverseOp::RestoreDetail { entry: prior, .. }) => {
        *entry = prior.clone()
      }
      _ => {}
    }
  }

  fn apply(&self, store: &CacheStore, id: &str, id_field: &str) {
    match self {
      InverseOp::RestoreListRecord { key, index, record } => {
        store.modify(key, |entry| {
          if let QueryData::List(records) = &mut entry.result {
            match position(records, id, id_field) {
              Some(at) => records[at] = record.clone(),
              None => trace!(key = %key, index, "record gone, nothing to restore"),
            }
          }
        });
      }
      InverseOp::ReinsertListRecord {
        key,
        index,
        record,
        total_decremented,
      } => {
        store.modify(key, |entry| {
          let QueryData::List(records) = &mut entry.result else {
            return;
          };
          if position(records, id, id_field).is_some() {
            return;
          }
          records.insert((*index).min(records.len()), record.clone());
          if *total_decremented {
            if let Some(p) = entry.pagination.as_mut() {
              p.total += 1;
            }
          }
        });
      }
      InverseOp::RestoreDetail { key, entry } => store.restore(key, entry.clone()),
    }
  }
}

/// A reversible delta queued against cache entries while a mutation is in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticPatch {
  pub record_id: String,
  pub target_entry_keys: Vec<CacheKey>,
  pub forward_delta: Value,
  pub inverse_delta: Vec<InverseOp>,
  pub applied_at: DateTime<Utc>,
}

impl OptimisticPatch {
  fn empty(id: &str, forward_delta: Value) -> Self {
    Self {
      record_id: id.to_string(),
      target_entry_keys: Vec::new(),
      forward_delta,
      inverse_delta: Vec::new(),
      applied_at: Utc::now(),
    }
  }

  fn push(&mut self, op: InverseOp) {
    let key = op.key().clone();
    if !self.target_entry_keys.contains(&key) {
      self.target_entry_keys.push(key);
    }
    self.inverse_delta.push(op);
  }

  /// Merge `delta` into every cached copy of record `id`.
  pub fn apply_update(
    store: &CacheStore,
    entity: &str,
    id: &str,
    delta: &Value,
    id_field: &str,
  ) -> Self {
    let mut patch = Self::empty(id, delta.clone());

    for key in store.keys_for(entity) {
      if key.is_list() {
        let mut prior = None;
        store.modify(&key, |entry| {
          if let QueryData::List(records) = &mut entry.result {
            if let Some(at) = position(records, id, id_field) {
              prior = Some((at, records[at].clone()));
              merge(&mut records[at], delta);
            }
          }
        });
        if let Some((index, record)) = prior {
          patch.push(InverseOp::RestoreListRecord { key, index, record });
        }
      } else if key.detail_id() == Some(id) {
        let before = store.get(&key);
        if store.modify(&key, |entry| {
          if let QueryData::Record(record) = &mut entry.result {
            merge(record, delta);
          }
        }) {
          patch.push(InverseOp::RestoreDetail { key, entry: before });
        }
      }
    }

    patch
  }

  /// Remove record `id` from every list and clear its detail entry.
  pub fn apply_delete(store: &CacheStore, entity: &str, id: &str, id_field: &str) -> Self {
    let mut patch = Self::empty(id, Value::Null);

    for key in store.keys_for(entity) {
      if key.is_list() {
        let mut removed = None;
        store.modify(&key, |entry| {
          let QueryData::List(records) = &mut entry.result else {
            return;
          };
          let Some(at) = position(records, id, id_field) else {
            return;
          };
          let record = records.remove(at);
          let decremented = match entry.pagination.as_mut() {
            Some(p) if p.total > 0 => {
              p.total -= 1;
              true
            }
            _ => false,
          };
          removed = Some((at, record, decremented));
        });
        if let Some((index, record, total_decremented)) = removed {
          patch.push(InverseOp::ReinsertListRecord {
            key,
            index,
            record,
            total_decremented,
          });
        }
      } else if key.detail_id() == Some(id) {
        let before = store.clear(&key);
        if before.is_some() {
          patch.push(InverseOp::RestoreDetail { key, entry: before });
        }
      }
    }

    patch
  }

  /// Undo this patch, newest change first.
  pub fn rollback(&self, store: &CacheStore, id_field: &str) {
    for op in self.inverse_delta.iter().rev() {
      op.apply(store, &self.record_id, id_field);
    }
  }

  /// An older mutation on the same record failed while this one is still pending.
  ///
  /// Entries both touched now restore to the older snapshot. Returns the older
  /// ops this patch does not cover; they are safe to apply right away.
  pub fn rebase_onto(&mut self, older: &OptimisticPatch) -> OptimisticPatch {
    let mut leftover = OptimisticPatch::empty(&older.record_id, Value::Null);
    for older_op in &older.inverse_delta {
      match self
        .inverse_delta
        .iter_mut()
        .find(|op| op.key() == older_op.key())
      {
        Some(op) => op.adopt(older_op),
        None => leftover.push(older_op.clone()),
      }
    }
    leftover
  }

  /// The record is now confirmed as `record`; undoing this patch should land there.
  pub fn set_prior(&mut self, record: &Record) {
    for op in &mut self.inverse_delta {
      op.set_prior(record);
    }
  }

  /// Stop tracking entries whose contents the server has since confirmed.
  pub fn forget(&mut self, keys: &[CacheKey]) {
    self.inverse_delta.retain(|op| !keys.contains(op.key()));
    self.target_entry_keys.retain(|k| !keys.contains(k));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Pagination, QueryArgs};
  use serde_json::json;

  const ID: &str = "_id";

  fn seeded() -> (CacheStore, CacheKey, CacheKey) {
    let store = CacheStore::new();
    let list = CacheKey::list("Product", "listProduct", &QueryArgs::page(1, 10));
    let detail = CacheKey::detail("Product", "getProduct", "a", &QueryArgs::new());
    store.write(
      &list,
      CacheEntry::new(
        list.serialized_args.clone(),
        QueryData::List(vec![
          json!({"_id": "a", "name": "old", "qty": 1}),
          json!({"_id": "b", "name": "other"}),
        ]),
        Some(Pagination {
          page: 1,
          limit: 10,
          total: 2,
        }),
      ),
    );
    store.write(
      &detail,
      CacheEntry::new(
        detail.serialized_args.clone(),
        QueryData::Record(json!({"_id": "a", "name": "old", "qty": 1})),
        None,
      ),
    );
    (store, list, detail)
  }

  #[test]
  fn test_update_then_rollback_is_exact() {
    let (store, list, detail) = seeded();
    let before = (store.get(&list), store.get(&detail));

    let patch = OptimisticPatch::apply_update(&store, "Product", "a", &json!({"name": "X"}), ID);
    assert_eq!(patch.target_entry_keys.len(), 2);
    assert_eq!(store.get(&list).unwrap().records().unwrap()[0]["name"], "X");
    assert_eq!(store.get(&list).unwrap().records().unwrap()[0]["qty"], 1);
    assert_eq!(store.get(&detail).unwrap().record().unwrap()["name"], "X");

    patch.rollback(&store, ID);
    assert_eq!((store.get(&list), store.get(&detail)), before);
  }

  #[test]
  fn test_delete_then_rollback_restores_position() {
    let (store, list, detail) = seeded();
    let before = (store.get(&list), store.get(&detail));

    let patch = OptimisticPatch::apply_delete(&store, "Product", "a", ID);
    let after = store.get(&list).unwrap();
    assert_eq!(after.records().unwrap().len(), 1);
    assert_eq!(after.pagination.unwrap().total, 1);
    assert!(store.get(&detail).is_none());

    patch.rollback(&store, ID);
    assert_eq!((store.get(&list), store.get(&detail)), before);
  }

  #[test]
  fn test_numeric_ids_match() {
    assert_eq!(record_id(&json!({"id": 42}), "id").as_deref(), Some("42"));
    assert_eq!(record_id(&json!({"id": null}), "id"), None);
  }

  #[test]
  fn test_rebase_hands_older_snapshot_to_newer() {
    let (store, list, _) = seeded();
    let older = OptimisticPatch::apply_update(&store, "Product", "a", &json!({"name": "v1"}), ID);
    let mut newer = OptimisticPatch::apply_update(&store, "Product", "a", &json!({"qty": 9}), ID);

    let leftover = newer.rebase_onto(&older);
    assert!(leftover.inverse_delta.is_empty());

    newer.rollback(&store, ID);
    assert_eq!(
      store.get(&list).unwrap().records().unwrap()[0],
      json!({"_id": "a", "name": "old", "qty": 1})
    );
  }

  #[test]
  fn test_forget_drops_confirmed_entries() {
    let (store, list, detail) = seeded();
    let mut patch = OptimisticPatch::apply_update(&store, "Product", "a", &json!({"name": "X"}), ID);
    patch.forget(&[list.clone()]);
    assert_eq!(patch.target_entry_keys, vec![detail]);
    patch.rollback(&store, ID);
    assert_eq!(store.get(&list).unwrap().records().unwrap()[0]["name"], "X");
  }
}
