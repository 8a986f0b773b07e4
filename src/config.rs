use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mutation::{Backoff, RetryPolicy};
use crate::poller::PollInterval;
use crate::portal::mutations;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub poller: PollerConfig,
  /// Retry policy per mutation, keyed by operation name
  #[serde(default)]
  pub mutations: MutationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base url, e.g. https://portal.example.com/api
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  #[serde(default = "default_page_size")]
  pub page_size: u32,
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_page_size() -> u32 {
  50
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Keep server data in SQLite between runs
  pub persist: bool,
  /// Database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  /// Seconds before cached data is refetched
  pub stale_secs: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persist: true,
      path: None,
      stale_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
  pub interval_ms: u64,
  /// Delay while the server is processing; enables status-dependent polling
  pub active_interval_ms: Option<u64>,
  /// Delay while the document is pending or queued
  pub waiting_interval_ms: Option<u64>,
  /// Stop after this many failed fetches in a row (unbounded if unset)
  pub max_consecutive_failures: Option<u32>,
}

impl Default for PollerConfig {
  fn default() -> Self {
    Self {
      interval_ms: 3000,
      active_interval_ms: None,
      waiting_interval_ms: None,
      max_consecutive_failures: None,
    }
  }
}

impl PollerConfig {
  pub fn interval(&self) -> PollInterval {
    let fixed = Duration::from_millis(self.interval_ms);
    match (self.active_interval_ms, self.waiting_interval_ms) {
      (None, None) => PollInterval::Fixed(fixed),
      (active, waiting) => PollInterval::ByStatus {
        active: active.map(Duration::from_millis).unwrap_or(fixed),
        waiting: waiting.map(Duration::from_millis).unwrap_or(fixed),
      },
    }
  }
}

/// Operations that may be named in the `mutations` section.
const MUTATION_NAMES: [&str; 7] = [
  mutations::DELETE_DOCUMENT,
  mutations::TOGGLE_FAVORITE,
  mutations::RESTORE_VERSION,
  mutations::REFRESH_STATUS,
  mutations::GRANT_PERMISSION,
  mutations::UPDATE_PERMISSION_ROLE,
  mutations::REVOKE_PERMISSION,
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct MutationsConfig {
  policies: BTreeMap<String, RetryPolicy>,
}

impl MutationsConfig {
  /// Retry policy for an operation. Re-requesting processing is safe to
  /// repeat, everything else is sent once unless configured otherwise.
  pub fn policy(&self, name: &str) -> RetryPolicy {
    if let Some(policy) = self.policies.get(name) {
      return *policy;
    }
    if name == mutations::REFRESH_STATUS {
      return RetryPolicy::idempotent(
        3,
        Backoff::Exponential {
          base_ms: 500,
          max_ms: 4000,
        },
      );
    }
    RetryPolicy::never()
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./docdesk.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/docdesk/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/docdesk/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("docdesk.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("docdesk").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config
      .validate()
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.api.url.trim().is_empty() {
      return Err(eyre!("api.url must not be empty"));
    }
    if self.cache.stale_secs < 0 {
      return Err(eyre!("cache.stale_secs must not be negative"));
    }
    for (name, policy) in &self.mutations.policies {
      if !MUTATION_NAMES.contains(&name.as_str()) {
        return Err(eyre!(
          "unknown mutation '{}' (expected one of: {})",
          name,
          MUTATION_NAMES.join(", ")
        ));
      }
      if policy.max_attempts == 0 {
        return Err(eyre!("mutations.{}.max_attempts must be at least 1", name));
      }
    }
    Ok(())
  }

  /// Get the portal API token from environment variables.
  ///
  /// Checks DOCDESK_API_TOKEN first, then PORTAL_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("DOCDESK_API_TOKEN")
      .or_else(|_| std::env::var("PORTAL_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set DOCDESK_API_TOKEN or PORTAL_API_TOKEN environment variable.")
      })
  }
}
