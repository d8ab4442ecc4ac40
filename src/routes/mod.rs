//! Route registry and runtime entity injection.

pub mod dynamic;
mod registry;
mod types;

pub use dynamic::{conventional_descriptor, DynamicInjector};
pub use registry::RouteRegistry;
pub use types::{
  DescriptorOrigin, EntityDescriptor, EntityRoutes, HttpMethod, Operation, RouteDescriptor,
};
