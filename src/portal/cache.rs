//! Caching implementations for portal types.

use sha2::{Digest, Sha256};

use crate::cache::{Cacheable, QueryKey};

use super::types::{Document, Employee, Permission, Resource, ResourceKind};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Document {
  fn entity_type() -> ResourceKind {
    ResourceKind::Document
  }

  fn into_resource(self) -> Resource {
    Resource::Document(self)
  }

  fn from_resource(resource: &Resource) -> Option<Self> {
    match resource {
      Resource::Document(d) => Some(d.clone()),
      _ => None,
    }
  }
}

impl Cacheable for Permission {
  fn entity_type() -> ResourceKind {
    ResourceKind::Permission
  }

  fn into_resource(self) -> Resource {
    Resource::Permission(self)
  }

  fn from_resource(resource: &Resource) -> Option<Self> {
    match resource {
      Resource::Permission(p) => Some(p.clone()),
      _ => None,
    }
  }
}

impl Cacheable for Employee {
  fn entity_type() -> ResourceKind {
    ResourceKind::Employee
  }

  fn into_resource(self) -> Resource {
    Resource::Employee(self)
  }

  fn from_resource(resource: &Resource) -> Option<Self> {
    match resource {
      Resource::Employee(e) => Some(e.clone()),
      _ => None,
    }
  }
}

// ============================================================================
// Query key types
// ============================================================================

/// List queries against the portal API.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DocumentFilter {
  pub folder: Option<String>,
  pub search: Option<String>,
  pub favorites_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortalQuery {
  /// Documents, optionally filtered
  Documents(DocumentFilter),
  /// Permissions granted on one document
  DocumentPermissions { document_id: String },
  /// Employee directory, optionally filtered
  Employees {
    department: Option<String>,
    search: Option<String>,
  },
}

impl PortalQuery {
  pub fn all_documents() -> Self {
    PortalQuery::Documents(DocumentFilter::default())
  }

  pub fn permissions_of(document_id: impl Into<String>) -> Self {
    PortalQuery::DocumentPermissions {
      document_id: document_id.into(),
    }
  }
}

impl QueryKey for PortalQuery {
  fn kind(&self) -> ResourceKind {
    match self {
      Self::Documents(_) => ResourceKind::Document,
      Self::DocumentPermissions { .. } => ResourceKind::Permission,
      Self::Employees { .. } => ResourceKind::Employee,
    }
  }

  fn cache_hash(&self) -> String {
    let input = match self {
      Self::Documents(filter) => format!(
        "documents:{}:{}:{}",
        filter.folder.as_deref().unwrap_or(""),
        filter.search.as_deref().map(normalize_search).unwrap_or_default(),
        filter.favorites_only
      ),
      Self::DocumentPermissions { document_id } => format!("permissions:{}", document_id),
      Self::Employees { department, search } => format!(
        "employees:{}:{}",
        department.as_deref().map(str::to_lowercase).unwrap_or_default(),
        search.as_deref().map(normalize_search).unwrap_or_default()
      ),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::Documents(filter) => {
        let mut parts = Vec::new();
        if let Some(folder) = &filter.folder {
          parts.push(format!("in {}", folder));
        }
        if let Some(search) = &filter.search {
          parts.push(format!("matching '{}'", search));
        }
        if filter.favorites_only {
          parts.push("favorites".to_string());
        }
        if parts.is_empty() {
          "all documents".to_string()
        } else {
          format!("documents {}", parts.join(", "))
        }
      }
      Self::DocumentPermissions { document_id } => format!("permissions of {}", document_id),
      Self::Employees { department, search } => match (department, search) {
        (Some(d), Some(s)) => format!("employees in {} matching '{}'", d, s),
        (Some(d), None) => format!("employees in {}", d),
        (None, Some(s)) => format!("employees matching '{}'", s),
        (None, None) => "all employees".to_string(),
      },
    }
  }
}

/// Normalize search text for consistent hashing.
/// Trims whitespace and lowercases for case-insensitive matching.
fn normalize_search(search: &str) -> String {
  search.trim().to_lowercase()
}
