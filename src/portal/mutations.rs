//! Mutation intents for the portal's write endpoints.
//!
//! Each builder pairs the REST call with the projection the cache shows
//! until the server answers. Labels double as keys of the `mutations`
//! section of the config file, where per-operation retry policies live.

use serde_json::json;

use super::cache::PortalQuery;
use super::types::{Document, DocumentStatus, Permission, ResourceKind, Role};
use crate::cache::CacheKey;
use crate::mutation::{MutationIntent, RemoteOperation};

pub const DELETE_DOCUMENT: &str = "delete_document";
pub const TOGGLE_FAVORITE: &str = "toggle_favorite";
pub const RESTORE_VERSION: &str = "restore_version";
pub const REFRESH_STATUS: &str = "refresh_status";
pub const GRANT_PERMISSION: &str = "grant_permission";
pub const UPDATE_PERMISSION_ROLE: &str = "update_permission_role";
pub const REVOKE_PERMISSION: &str = "revoke_permission";

/// Remove a document from every cached list, then delete it on the server.
pub fn delete_document(id: &str) -> MutationIntent {
  MutationIntent::new(
    DELETE_DOCUMENT,
    ResourceKind::Document,
    id,
    RemoteOperation::delete(["documents", id]),
  )
  .removes()
  .on_success("Document deleted")
  .on_error("Could not delete document")
}

/// Flip the favorite flag.
pub fn toggle_favorite(id: &str) -> MutationIntent {
  MutationIntent::new(
    TOGGLE_FAVORITE,
    ResourceKind::Document,
    id,
    RemoteOperation::post(["documents", id, "favorite"], None),
  )
  .project_as::<Document, _>(|doc| {
    Ok(Some(Document {
      is_favorite: !doc.is_favorite,
      ..doc.clone()
    }))
  })
  .on_success("Favorites updated")
  .on_error("Could not update favorites")
}

/// Make `version` the current version. Refused locally when the cached
/// document no longer lists that version.
pub fn restore_version(id: &str, version: u32) -> MutationIntent {
  let document_id = id.to_string();
  MutationIntent::new(
    RESTORE_VERSION,
    ResourceKind::Document,
    id,
    RemoteOperation::post(
      ["documents", id, "versions", version.to_string().as_str(), "restore"],
      None,
    ),
  )
  .project_as::<Document, _>(move |doc| {
    if !doc.has_version(version) {
      return Err(format!(
        "version {} of document {} no longer exists",
        version, document_id
      ));
    }
    Ok(Some(Document {
      current_version: version,
      ..doc.clone()
    }))
  })
  .on_success(format!("Restored version {}", version))
  .on_error("Could not restore version")
}

/// Ask the server to re-run processing. Shown as processing right away.
pub fn refresh_status(id: &str) -> MutationIntent {
  MutationIntent::new(
    REFRESH_STATUS,
    ResourceKind::Document,
    id,
    RemoteOperation::post(["documents", id, "refresh-status"], None),
  )
  .project_as::<Document, _>(|doc| {
    Ok(Some(Document {
      status: DocumentStatus::Processing,
      ..doc.clone()
    }))
  })
  .on_success("Processing restarted")
  .on_error("Could not restart processing")
}

/// Id given to a permission until the server assigns the real one.
pub fn provisional_permission_id(document_id: &str, principal_id: &str) -> String {
  format!("pending-{}-{}", document_id, principal_id)
}

/// Grant `principal_id` access to a document. A provisional permission is
/// listed immediately; the refetch after success replaces it.
pub fn grant_permission(document_id: &str, principal_id: &str, role: Role) -> MutationIntent {
  let provisional = Permission {
    id: provisional_permission_id(document_id, principal_id),
    document_id: document_id.to_string(),
    principal_id: principal_id.to_string(),
    role,
  };

  MutationIntent::new(
    GRANT_PERMISSION,
    ResourceKind::Permission,
    provisional.id.clone(),
    RemoteOperation::post(
      ["documents", document_id, "permissions"],
      Some(json!({
        "principalId": principal_id,
        "role": role.as_api_str(),
      })),
    ),
  )
  .insert_into(
    CacheKey::list(&PortalQuery::permissions_of(document_id)),
    provisional,
  )
  .on_success("Access granted")
  .on_error("Could not grant access")
}

pub fn update_permission_role(permission_id: &str, role: Role) -> MutationIntent {
  MutationIntent::new(
    UPDATE_PERMISSION_ROLE,
    ResourceKind::Permission,
    permission_id,
    RemoteOperation::patch(
      ["permissions", permission_id],
      json!({ "role": role.as_api_str() }),
    ),
  )
  .project_as::<Permission, _>(move |permission| {
    Ok(Some(Permission {
      role,
      ..permission.clone()
    }))
  })
  .on_success(format!("Role changed to {}", role))
  .on_error("Could not change role")
}

pub fn revoke_permission(permission_id: &str) -> MutationIntent {
  MutationIntent::new(
    REVOKE_PERMISSION,
    ResourceKind::Permission,
    permission_id,
    RemoteOperation::delete(["permissions", permission_id]),
  )
  .removes()
  .on_success("Access revoked")
  .on_error("Could not revoke access")
}
