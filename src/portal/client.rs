use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Method as HttpMethod, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use crate::config::Config;
use crate::mutation::{Method, MutationError, RemoteOperation, Transport};
use crate::poller::DocumentSource;
use crate::portal::api_types::{ApiDocument, ApiEmployee, ApiError, ApiList, ApiPermission};
use crate::portal::cache::DocumentFilter;
use crate::portal::types::{Document, Employee, Permission};

/// Portal REST API client
#[derive(Clone)]
pub struct PortalClient {
  client: Client,
  base: Url,
  token: String,
  page_size: u32,
}

impl PortalClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(
      &config.api.url,
      token,
      Duration::from_secs(config.api.timeout_secs),
      config.api.page_size,
    )
  }

  pub fn with_token(base_url: &str, token: String, timeout: Duration, page_size: u32) -> Result<Self> {
    let base = Url::parse(base_url).map_err(|e| eyre!("Invalid API url {}: {}", base_url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("Invalid API url {}: cannot hold a path", base_url));
    }

    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
      page_size: page_size.max(1),
    })
  }

  /// Absolute url for an endpoint below the base, e.g. `["documents", "7"]`.
  /// Every segment is percent-encoded.
  pub fn endpoint<S: AsRef<str>>(&self, segments: &[S]) -> Result<Url> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("API url {} cannot hold a path", self.base))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  async fn get_json<T: DeserializeOwned>(&self, segments: &[&str], query: &[(&str, String)]) -> Result<T> {
    let url = self.endpoint(segments)?;
    let path = url.path().to_string();
    trace!(%url, "GET");

    let response = self
      .client
      .get(url)
      .bearer_auth(&self.token)
      .query(query)
      .send()
      .await
      .map_err(|e| eyre!("Failed to GET {}: {}", path, e))?;

    let status = response.status();
    if !status.is_success() {
      let reason = error_reason(response).await;
      return Err(eyre!("GET {} failed ({}): {}", path, status.as_u16(), reason));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response of {}: {}", path, e))
  }

  /// Fetch every page of a list endpoint.
  async fn get_all<T: DeserializeOwned>(&self, segments: &[&str], query: Vec<(&str, String)>) -> Result<Vec<T>> {
    let mut all = Vec::new();
    let mut page = 1u32;

    loop {
      let mut params = query.clone();
      params.push(("page", page.to_string()));
      params.push(("pageSize", self.page_size.to_string()));

      let list = self.get_json::<ApiList<T>>(segments, &params).await?;
      let bare = list.is_bare();
      let (items, total) = list.into_parts();
      let count = items.len() as u64;
      all.extend(items);

      if is_last_page(bare, total, all.len() as u64, count, self.page_size) {
        break;
      }
      page += 1;
    }

    debug!(path = %segments.join("/"), count = all.len(), "fetched list");
    Ok(all)
  }

  /// List documents matching a filter
  pub async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
    let mut query = Vec::new();
    if let Some(folder) = &filter.folder {
      query.push(("folder", folder.clone()));
    }
    if let Some(search) = &filter.search {
      query.push(("search", search.clone()));
    }
    if filter.favorites_only {
      query.push(("favorites", "true".to_string()));
    }

    let documents: Vec<ApiDocument> = self.get_all(&["documents"], query).await?;
    Ok(documents.into_iter().map(Document::from).collect())
  }

  /// Get a single document by id
  pub async fn get_document(&self, id: &str) -> Result<Document> {
    let document: ApiDocument = self
      .get_json(&["documents", id], &[])
      .await
      .map_err(|e| eyre!("Failed to get document {}: {}", id, e))?;
    Ok(document.into())
  }

  /// Permissions granted on a document
  pub async fn list_permissions(&self, document_id: &str) -> Result<Vec<Permission>> {
    let permissions: Vec<ApiPermission> = self
      .get_all(&["documents", document_id, "permissions"], Vec::new())
      .await?;

    permissions
      .into_iter()
      .map(|p| Permission::try_from(p).map_err(|e| eyre!("Failed to parse permission: {}", e)))
      .collect()
  }

  /// Employee directory, optionally filtered
  pub async fn list_employees(
    &self,
    department: Option<&str>,
    search: Option<&str>,
  ) -> Result<Vec<Employee>> {
    let mut query = Vec::new();
    if let Some(department) = department {
      query.push(("department", department.to_string()));
    }
    if let Some(search) = search {
      query.push(("search", search.to_string()));
    }

    let employees: Vec<ApiEmployee> = self.get_all(&["employees"], query).await?;
    Ok(employees.into_iter().map(Employee::from).collect())
  }
}

#[async_trait]
impl Transport for PortalClient {
  async fn send(&self, operation: &RemoteOperation) -> Result<Option<Value>, MutationError> {
    let url = self
      .endpoint(operation.segments.as_slice())
      .map_err(|e| MutationError::Precondition(e.to_string()))?;
    debug!(%operation, "sending");

    let mut request = self
      .client
      .request(http_method(operation.method), url)
      .bearer_auth(&self.token);
    if let Some(body) = &operation.body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| MutationError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(MutationError::Rejected {
        status: status.as_u16(),
        message: error_reason(response).await,
      });
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| MutationError::Network(e.to_string()))?;
    if body.is_empty() {
      return Ok(None);
    }
    // A success with a non-JSON body is still a success
    Ok(serde_json::from_slice(&body).ok())
  }
}

#[async_trait]
impl DocumentSource for PortalClient {
  async fn fetch_document(&self, id: &str) -> Result<Document> {
    self.get_document(id).await
  }
}

fn http_method(method: Method) -> HttpMethod {
  match method {
    Method::Post => HttpMethod::POST,
    Method::Patch => HttpMethod::PATCH,
    Method::Delete => HttpMethod::DELETE,
  }
}

/// Bare arrays, empty pages, short pages and pages reaching the server's
/// total end pagination.
fn is_last_page(bare: bool, total: Option<u64>, fetched: u64, count: u64, page_size: u32) -> bool {
  if bare || count == 0 || count < u64::from(page_size) {
    return true;
  }
  total.is_some_and(|total| fetched >= total)
}

/// The server's `message`/`error` field, or the status text.
async fn error_reason(response: Response) -> String {
  let status = response.status();
  let text = response.text().await.unwrap_or_default();
  reason_from_body(&text).unwrap_or_else(|| {
    status
      .canonical_reason()
      .unwrap_or("request failed")
      .to_string()
  })
}

fn reason_from_body(body: &str) -> Option<String> {
  serde_json::from_str::<ApiError>(body)
    .ok()
    .and_then(ApiError::reason)
}
