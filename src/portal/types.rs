use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing status of an uploaded document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
  Pending,
  Queued,
  Processing,
  Completed,
  Failed,
}

impl DocumentStatus {
  /// Terminal statuses need no further polling.
  pub fn is_terminal(self) -> bool {
    matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
  }
}

impl fmt::Display for DocumentStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      DocumentStatus::Pending => "pending",
      DocumentStatus::Queued => "queued",
      DocumentStatus::Processing => "processing",
      DocumentStatus::Completed => "completed",
      DocumentStatus::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// One stored revision of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
  pub number: u32,
  pub created_at: String,
  pub author_id: Option<String>,
}

/// Document as shown in lists and detail views
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  pub title: String,
  pub owner_id: String,
  pub folder: Option<String>,
  pub is_favorite: bool,
  pub status: DocumentStatus,
  pub current_version: u32,
  pub versions: Vec<DocumentVersion>,
  pub updated_at: String,
}

impl Document {
  pub fn has_version(&self, number: u32) -> bool {
    self.versions.iter().any(|v| v.number == number)
  }
}

/// Access level granted on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Viewer,
  Editor,
  Owner,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Role::Viewer => "viewer",
      Role::Editor => "editor",
      Role::Owner => "owner",
    };
    f.write_str(s)
  }
}

impl std::str::FromStr for Role {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "viewer" => Ok(Role::Viewer),
      "editor" => Ok(Role::Editor),
      "owner" => Ok(Role::Owner),
      other => Err(format!("unknown role '{}'", other)),
    }
  }
}

/// A principal's access to a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
  pub id: String,
  pub document_id: String,
  pub principal_id: String,
  pub role: Role,
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
  pub id: String,
  pub name: String,
  pub email: String,
  pub department: Option<String>,
  pub title: Option<String>,
  pub updated_at: String,
}

/// Kinds of resource held in the query cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
  Document,
  Permission,
  Employee,
}

impl ResourceKind {
  pub fn as_str(self) -> &'static str {
    match self {
      ResourceKind::Document => "document",
      ResourceKind::Permission => "permission",
      ResourceKind::Employee => "employee",
    }
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Any value the cache can hold, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Resource {
  Document(Document),
  Permission(Permission),
  Employee(Employee),
}

impl Resource {
  pub fn kind(&self) -> ResourceKind {
    match self {
      Resource::Document(_) => ResourceKind::Document,
      Resource::Permission(_) => ResourceKind::Permission,
      Resource::Employee(_) => ResourceKind::Employee,
    }
  }

  pub fn id(&self) -> &str {
    match self {
      Resource::Document(d) => &d.id,
      Resource::Permission(p) => &p.id,
      Resource::Employee(e) => &e.id,
    }
  }

  /// Schema checks applied whenever a value enters the cache.
  pub fn validate(&self) -> Result<(), String> {
    if self.id().trim().is_empty() {
      return Err(format!("{} has an empty id", self.kind()));
    }
    match self {
      Resource::Document(d) => {
        if d.title.trim().is_empty() {
          return Err(format!("document {} has an empty title", d.id));
        }
        if !d.versions.is_empty() && !d.has_version(d.current_version) {
          return Err(format!(
            "document {} points at missing version {}",
            d.id, d.current_version
          ));
        }
      }
      Resource::Permission(p) => {
        if p.document_id.is_empty() || p.principal_id.is_empty() {
          return Err(format!("permission {} is missing its document or principal", p.id));
        }
      }
      Resource::Employee(e) => {
        if e.email.is_empty() {
          return Err(format!("employee {} has no email", e.id));
        }
      }
    }
    Ok(())
  }
}

impl From<Document> for Resource {
  fn from(d: Document) -> Self {
    Resource::Document(d)
  }
}

impl From<Permission> for Resource {
  fn from(p: Permission) -> Self {
    Resource::Permission(p)
  }
}

impl From<Employee> for Resource {
  fn from(e: Employee) -> Self {
    Resource::Employee(e)
  }
}
