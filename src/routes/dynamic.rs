//! Runtime route synthesis for entities missing from the static registry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use regex::Regex;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

use super::registry::RouteRegistry;
use super::types::{DescriptorOrigin, EntityDescriptor, EntityRoutes, HttpMethod, RouteDescriptor};

/// Verb used by the list and update routes of a synthesized entity
pub const LIST_UPDATE_METHOD: HttpMethod = HttpMethod::Patch;
pub const CREATE_METHOD: HttpMethod = HttpMethod::Post;
pub const DELETE_METHOD: HttpMethod = HttpMethod::Delete;
pub const GET_METHOD: HttpMethod = HttpMethod::Get;

fn entity_name_pattern() -> Option<&'static Regex> {
  static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
  PATTERN
    .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").ok())
    .as_ref()
}

/// A letter followed by letters, digits, `_` or `-`.
pub fn is_valid_entity_name(name: &str) -> bool {
  if let Some(pattern) = entity_name_pattern() {
    return pattern.is_match(name);
  }
  let mut chars = name.chars();
  chars.next().is_some_and(|c| c.is_ascii_alphabetic())
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Build the conventional route set for `name`.
///
/// Every route shares the endpoint `"/" + lowercase(name)`; identifiers are
/// `list<Name>`, `get<Name>` and so on.
pub fn conventional_descriptor(name: &str) -> EntityDescriptor {
  let endpoint = format!("/{}", name.to_lowercase());
  let route = |method, verb: &str| RouteDescriptor::new(method, endpoint.clone(), format!("{verb}{name}"));

  EntityDescriptor {
    name: name.to_string(),
    routes: EntityRoutes {
      list: route(LIST_UPDATE_METHOD, "list"),
      get: route(GET_METHOD, "get"),
      create: route(CREATE_METHOD, "create"),
      update: route(LIST_UPDATE_METHOD, "update"),
      delete: route(DELETE_METHOD, "delete"),
    },
    origin: DescriptorOrigin::Dynamic,
  }
}

/// Resolves entity names, injecting conventional routes on first reference.
#[derive(Debug)]
pub struct DynamicInjector {
  registry: Arc<RouteRegistry>,
  injected: Mutex<HashSet<String>>,
  registrations: AtomicUsize,
}

impl DynamicInjector {
  pub fn new(registry: Arc<RouteRegistry>) -> Self {
    Self {
      registry,
      injected: Mutex::default(),
      registrations: AtomicUsize::new(0),
    }
  }

  pub fn registry(&self) -> &Arc<RouteRegistry> {
    &self.registry
  }

  /// Look up `entity`, synthesizing its routes if nobody knows it yet.
  pub fn resolve(&self, entity: &str) -> SyncResult<Arc<EntityDescriptor>> {
    if self.registry.is_static(entity) {
      return self.registry.get_routes(entity);
    }
    self.inject(entity)?;
    self.registry.get_routes(entity)
  }

  /// Register conventional routes for `entity` once. Repeated calls are no-ops.
  ///
  /// Returns true only for the call that actually registered.
  pub fn inject(&self, entity: &str) -> SyncResult<bool> {
    let key = entity.to_lowercase();
    let mut injected = self.injected.lock().unwrap_or_else(PoisonError::into_inner);
    if injected.contains(&key) {
      return Ok(false);
    }

    if self.registry.is_static(entity) {
      debug!(entity, "skipping injection, static descriptor exists");
      return Ok(false);
    }

    if !is_valid_entity_name(entity) {
      return Err(SyncError::InvalidEntityName(entity.to_string()));
    }

    let registered = self.registry.register_dynamic(conventional_descriptor(entity));
    injected.insert(key);
    if registered {
      self.registrations.fetch_add(1, Ordering::Relaxed);
      info!(entity, "injected conventional routes");
    }
    Ok(registered)
  }

  /// How many route sets were registered at runtime.
  pub fn registrations(&self) -> usize {
    self.registrations.load(Ordering::Relaxed)
  }
}
