//! Entity name to route descriptor lookup.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{SyncError, SyncResult};

use super::types::{DescriptorOrigin, EntityDescriptor};

/// Static descriptors plus whatever was registered at runtime.
///
/// Names are matched case-insensitively and a static descriptor always wins.
#[derive(Debug, Default)]
pub struct RouteRegistry {
  statics: HashMap<String, Arc<EntityDescriptor>>,
  dynamics: RwLock<HashMap<String, Arc<EntityDescriptor>>>,
}

impl RouteRegistry {
  pub fn new(descriptors: impl IntoIterator<Item = EntityDescriptor>) -> Self {
    let statics = descriptors
      .into_iter()
      .map(|mut d| {
        d.origin = DescriptorOrigin::Static;
        (d.name.to_lowercase(), Arc::new(d))
      })
      .collect();

    Self {
      statics,
      dynamics: RwLock::default(),
    }
  }

  /// Pure lookup.
  pub fn get_routes(&self, entity: &str) -> SyncResult<Arc<EntityDescriptor>> {
    let key = entity.to_lowercase();
    if let Some(descriptor) = self.statics.get(&key) {
      return Ok(Arc::clone(descriptor));
    }

    self
      .dynamics
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&key)
      .cloned()
      .ok_or_else(|| SyncError::EntityNotFound(entity.to_string()))
  }

  pub fn is_static(&self, entity: &str) -> bool {
    self.statics.contains_key(&entity.to_lowercase())
  }

  /// Register a runtime descriptor. Returns false when the name is already taken.
  pub(crate) fn register_dynamic(&self, descriptor: EntityDescriptor) -> bool {
    let key = descriptor.name.to_lowercase();
    if self.statics.contains_key(&key) {
      return false;
    }

    let mut dynamics = self
      .dynamics
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    if dynamics.contains_key(&key) {
      return false;
    }
    dynamics.insert(key, Arc::new(descriptor));
    true
  }

  /// Names of every known entity, static first.
  pub fn entity_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.statics.values().map(|d| d.name.clone()).collect();
    names.sort();
    let mut dynamic: Vec<String> = self
      .dynamics
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .map(|d| d.name.clone())
      .collect();
    dynamic.sort();
    names.extend(dynamic);
    names
  }
}
