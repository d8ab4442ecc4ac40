//! Core types for the cache: keys, arguments, tags and entries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A business record as returned by the server.
pub type Record = Value;

pub const PAGE_NUMBER: &str = "pageNumber";
pub const PAGE_LIMIT: &str = "pageLimit";
pub const DEFAULT_PAGE_NUMBER: u64 = 1;
pub const DEFAULT_PAGE_LIMIT: u64 = 10;

/// Query arguments kept in canonical (key-sorted) order so identical
/// arguments always serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArgs(BTreeMap<String, Value>);

impl QueryArgs {
  pub fn new() -> Self {
    Self::default()
  }

  /// List arguments for the given page.
  pub fn page(page_number: u64, page_limit: u64) -> Self {
    Self::new()
      .with(PAGE_NUMBER, page_number)
      .with(PAGE_LIMIT, page_limit)
  }

  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.0.insert(key.into(), value.into());
    self
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  /// Fill in `pageNumber` / `pageLimit` when absent.
  pub fn with_list_defaults(mut self, default_limit: u64) -> Self {
    self
      .0
      .entry(PAGE_NUMBER.to_string())
      .or_insert(Value::from(DEFAULT_PAGE_NUMBER));
    self
      .0
      .entry(PAGE_LIMIT.to_string())
      .or_insert(Value::from(default_limit));
    self
  }

  pub fn page_limit(&self) -> Option<u64> {
    self.0.get(PAGE_LIMIT).and_then(value_as_u64)
  }

  pub fn page_number(&self) -> Option<u64> {
    self.0.get(PAGE_NUMBER).and_then(value_as_u64)
  }

  pub fn to_json(&self) -> Value {
    Value::Object(self.0.clone().into_iter().collect::<Map<String, Value>>())
  }

  /// Canonical serialized form, used as part of the cache key.
  pub fn serialize(&self) -> String {
    serde_json::to_string(&self.0).unwrap_or_default()
  }

  pub fn from_serialized(s: &str) -> Self {
    serde_json::from_str(s).map(Self).unwrap_or_default()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }
}

fn value_as_u64(v: &Value) -> Option<u64> {
  match v {
    Value::Number(n) => n.as_u64(),
    Value::String(s) => s.parse().ok(),
    _ => None,
  }
}

/// Whether a cached query is a paged list or a single record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKind {
  List,
  Detail { id: String },
}

/// Identity of one cache entry: (entity, operation identifier, id, serialized args).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  /// Canonical entity name as registered
  pub entity: String,
  pub identifier: String,
  pub kind: QueryKind,
  pub serialized_args: String,
}

impl CacheKey {
  pub fn list(entity: &str, identifier: &str, args: &QueryArgs) -> Self {
    Self {
      entity: entity.to_string(),
      identifier: identifier.to_string(),
      kind: QueryKind::List,
      serialized_args: args.serialize(),
    }
  }

  pub fn detail(entity: &str, identifier: &str, id: &str, args: &QueryArgs) -> Self {
    Self {
      entity: entity.to_string(),
      identifier: identifier.to_string(),
      kind: QueryKind::Detail { id: id.to_string() },
      serialized_args: args.serialize(),
    }
  }

  pub fn is_list(&self) -> bool {
    matches!(self.kind, QueryKind::List)
  }

  pub fn detail_id(&self) -> Option<&str> {
    match &self.kind {
      QueryKind::Detail { id } => Some(id),
      QueryKind::List => None,
    }
  }

  pub fn args(&self) -> QueryArgs {
    QueryArgs::from_serialized(&self.serialized_args)
  }

  /// Tags this query provides.
  pub fn tags(&self) -> Vec<Tag> {
    let mut tags = vec![Tag::Entity(self.entity.clone())];
    if let QueryKind::Detail { id } = &self.kind {
      tags.push(Tag::Record(self.entity.clone(), id.clone()));
    }
    tags
  }

  /// Stable fixed-length hash for logs.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.kind {
      QueryKind::List => write!(f, "{}({})", self.identifier, self.serialized_args),
      QueryKind::Detail { id } => write!(f, "{}[{}]({})", self.identifier, id, self.serialized_args),
    }
  }
}

/// Invalidation tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
  Entity(String),
  Record(String, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
  #[serde(default)]
  pub page: u64,
  #[serde(default)]
  pub limit: u64,
  #[serde(default, alias = "totalCount")]
  pub total: u64,
}

/// Cached result payload.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
  Record(Record),
  List(Vec<Record>),
}

/// One cached query result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub serialized_args: String,
  pub result: QueryData,
  pub pagination: Option<Pagination>,
  pub last_fetched_at: DateTime<Utc>,
  /// Live subscribers at the time this copy was read
  pub subscriber_count: usize,
}

impl CacheEntry {
  pub fn new(serialized_args: String, result: QueryData, pagination: Option<Pagination>) -> Self {
    Self {
      serialized_args,
      result,
      pagination,
      last_fetched_at: Utc::now(),
      subscriber_count: 0,
    }
  }

  pub fn records(&self) -> Option<&Vec<Record>> {
    match &self.result {
      QueryData::List(records) => Some(records),
      QueryData::Record(_) => None,
    }
  }

  pub fn record(&self) -> Option<&Record> {
    match &self.result {
      QueryData::Record(record) => Some(record),
      QueryData::List(_) => None,
    }
  }
}

/// Result from a cache-backed read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was fetched
  pub cached_at: DateTime<Utc>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at,
    }
  }

  pub fn joined(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Joined,
      cached_at,
    }
  }
}

/// Indicates where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// This caller issued the network request
  Network,
  /// Served from cache within the freshness window
  CacheFresh,
  /// Shared another caller's in-flight request
  Joined,
}
