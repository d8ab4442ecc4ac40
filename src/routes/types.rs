//! Route descriptor types.

use serde::{Deserialize, Serialize};

/// HTTP verb of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Patch => "PATCH",
      HttpMethod::Delete => "DELETE",
    }
  }

  /// Whether arguments travel as a JSON body rather than query parameters.
  pub fn carries_body(&self) -> bool {
    !matches!(self, HttpMethod::Get | HttpMethod::Delete)
  }
}

/// The five operations every entity exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  List,
  Get,
  Create,
  Update,
  Delete,
}

/// {method, endpoint, identifier} for one REST operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
  pub method: HttpMethod,
  pub endpoint: String,
  /// Unique name of the operation; scopes cache keys and in-flight dedup
  pub identifier: String,
}

impl RouteDescriptor {
  pub fn new(method: HttpMethod, endpoint: impl Into<String>, identifier: impl Into<String>) -> Self {
    Self {
      method,
      endpoint: endpoint.into(),
      identifier: identifier.into(),
    }
  }

  /// Resolve the request path, substituting `:id` / `{id}` or appending `/{id}`.
  pub fn path(&self, id: Option<&str>) -> String {
    let Some(id) = id else {
      return self.endpoint.clone();
    };
    if self.endpoint.contains(":id") {
      self.endpoint.replace(":id", id)
    } else if self.endpoint.contains("{id}") {
      self.endpoint.replace("{id}", id)
    } else {
      format!("{}/{}", self.endpoint.trim_end_matches('/'), id)
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRoutes {
  pub list: RouteDescriptor,
  pub get: RouteDescriptor,
  pub create: RouteDescriptor,
  pub update: RouteDescriptor,
  pub delete: RouteDescriptor,
}

/// Where a descriptor came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DescriptorOrigin {
  #[default]
  Static,
  /// Synthesized by naming convention at runtime
  Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
  pub name: String,
  pub routes: EntityRoutes,
  #[serde(skip)]
  pub origin: DescriptorOrigin,
}

impl EntityDescriptor {
  pub fn route(&self, op: Operation) -> &RouteDescriptor {
    match op {
      Operation::List => &self.routes.list,
      Operation::Get => &self.routes.get,
      Operation::Create => &self.routes.create,
      Operation::Update => &self.routes.update,
      Operation::Delete => &self.routes.delete,
    }
  }
}
