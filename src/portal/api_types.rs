//! Serde-deserializable types matching portal API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::types::{Document, DocumentStatus, DocumentVersion, Employee, Permission, Role};

/// Ids arrive as strings from some endpoints and as numbers from others.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

// ============================================================================
// Pagination
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiPage<T> {
  #[serde(default = "Vec::new")]
  pub items: Vec<T>,
  pub total: Option<u64>,
}

/// List endpoints answer either with a page object or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiList<T> {
  Bare(Vec<T>),
  Page(ApiPage<T>),
}

impl<T> ApiList<T> {
  /// A bare array holds the whole collection.
  pub fn is_bare(&self) -> bool {
    matches!(self, ApiList::Bare(_))
  }

  /// Items plus the server's total, if it sent one.
  pub fn into_parts(self) -> (Vec<T>, Option<u64>) {
    match self {
      ApiList::Page(page) => (page.items, page.total),
      ApiList::Bare(items) => (items, None),
    }
  }
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersion {
  #[serde(alias = "number")]
  pub version: u32,
  #[serde(default)]
  pub created_at: String,
  pub author_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDocument {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(alias = "name")]
  pub title: String,
  #[serde(deserialize_with = "deserialize_id")]
  pub owner_id: String,
  pub folder: Option<String>,
  #[serde(default)]
  pub is_favorite: bool,
  /// Missing on freshly uploaded documents
  pub status: Option<String>,
  #[serde(default)]
  pub current_version: Option<u32>,
  #[serde(default)]
  pub versions: Vec<ApiVersion>,
  #[serde(default)]
  pub updated_at: String,
}

// ============================================================================
// Permissions
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPermission {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(deserialize_with = "deserialize_id")]
  pub document_id: String,
  #[serde(alias = "userId", deserialize_with = "deserialize_id")]
  pub principal_id: String,
  pub role: String,
}

// ============================================================================
// Employees
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEmployee {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(default)]
  pub first_name: String,
  #[serde(default)]
  pub last_name: String,
  pub email: String,
  /// Either a plain name or an object with a `name` field
  pub department: Option<Value>,
  pub job_title: Option<String>,
  #[serde(default)]
  pub updated_at: String,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiError {
  pub message: Option<String>,
  pub error: Option<String>,
}

impl ApiError {
  pub fn reason(self) -> Option<String> {
    self.message.or(self.error).filter(|s| !s.is_empty())
  }
}

// ============================================================================
// Conversions to domain types
// ============================================================================

/// Map a status string to the domain enum, unknown values count as pending.
pub fn parse_status(status: &str) -> DocumentStatus {
  match status.to_ascii_lowercase().as_str() {
    "queued" => DocumentStatus::Queued,
    "processing" | "in_progress" => DocumentStatus::Processing,
    "completed" | "done" | "ready" => DocumentStatus::Completed,
    "failed" | "error" => DocumentStatus::Failed,
    _ => DocumentStatus::Pending,
  }
}

impl From<ApiDocument> for Document {
  fn from(d: ApiDocument) -> Self {
    let versions: Vec<DocumentVersion> = d
      .versions
      .into_iter()
      .map(|v| DocumentVersion {
        number: v.version,
        created_at: v.created_at,
        author_id: v.author_id.as_ref().and_then(value_to_id),
      })
      .collect();

    // Fall back to the newest known version when the server omits it
    let current_version = d
      .current_version
      .or_else(|| versions.iter().map(|v| v.number).max())
      .unwrap_or(1);

    Document {
      id: d.id,
      title: d.title,
      owner_id: d.owner_id,
      folder: d.folder,
      is_favorite: d.is_favorite,
      status: d
        .status
        .as_deref()
        .map(parse_status)
        .unwrap_or(DocumentStatus::Pending),
      current_version,
      versions,
      updated_at: d.updated_at,
    }
  }
}

impl TryFrom<ApiPermission> for Permission {
  type Error = String;

  fn try_from(p: ApiPermission) -> Result<Self, Self::Error> {
    Ok(Permission {
      id: p.id,
      document_id: p.document_id,
      principal_id: p.principal_id,
      role: p.role.parse()?,
    })
  }
}

impl From<ApiEmployee> for Employee {
  fn from(e: ApiEmployee) -> Self {
    let name = format!("{} {}", e.first_name.trim(), e.last_name.trim())
      .trim()
      .to_string();
    Employee {
      id: e.id,
      name: if name.is_empty() { e.email.clone() } else { name },
      email: e.email,
      department: extract_name(e.department.as_ref()),
      title: e.job_title,
      updated_at: e.updated_at,
    }
  }
}

// ============================================================================
// Helpers
// ============================================================================

fn value_to_id(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Extract a display name from a field that can be:
/// - A string
/// - An object with a "name" field
/// - null
fn extract_name(value: Option<&Value>) -> Option<String> {
  let value = value?;

  if let Some(s) = value.as_str() {
    return Some(s.to_string());
  }

  value
    .get("name")
    .and_then(|v| v.as_str())
    .map(str::to_string)
}

impl Role {
  pub fn as_api_str(self) -> &'static str {
    match self {
      Role::Viewer => "viewer",
      Role::Editor => "editor",
      Role::Owner => "owner",
    }
  }
}
