//! Portal domain: documents, permissions and the employee directory.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod mutations;
pub mod types;

pub use cache::{DocumentFilter, PortalQuery};
pub use cached_client::CachedPortal;
pub use client::PortalClient;
pub use types::{Document, DocumentStatus, Employee, Permission, Resource, ResourceKind, Role};
