use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_PAGE_LIMIT;
use crate::db::Database;
use crate::routes::EntityDescriptor;

pub const ACCESS_TOKEN_ENV: &str = "CRUDSYNC_ACCESS_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub paging: PagingConfig,
  /// Field that carries a record's identity
  #[serde(default = "default_id_field")]
  pub id_field: String,
  /// Case-insensitive regexes matched against error messages
  #[serde(default = "default_permission_denied_patterns")]
  pub permission_denied_patterns: Vec<String>,
  #[serde(default = "default_unauthorized_statuses")]
  pub unauthorized_statuses: Vec<u16>,
  /// SQLite file holding the session (defaults to the user data dir)
  pub token_store: Option<PathBuf>,
  /// Statically known entities; anything else gets conventional routes
  #[serde(default)]
  pub entities: Vec<EntityDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  #[serde(default = "default_refresh_endpoint")]
  pub refresh_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Seconds an entry is served without refetching
  #[serde(default = "default_sixty")]
  pub stale_time_secs: u64,
  /// Seconds an unsubscribed entry survives before eviction
  #[serde(default = "default_sixty")]
  pub gc_time_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: default_sixty(),
      gc_time_secs: default_sixty(),
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_secs(self.stale_time_secs)
  }

  pub fn gc_time(&self) -> Duration {
    Duration::from_secs(self.gc_time_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagingConfig {
  #[serde(default = "default_page_limit")]
  pub default_page_limit: u64,
}

impl Default for PagingConfig {
  fn default() -> Self {
    Self {
      default_page_limit: default_page_limit(),
    }
  }
}

fn default_id_field() -> String {
  "_id".to_string()
}

fn default_permission_denied_patterns() -> Vec<String> {
  vec![
    "permission denied".to_string(),
    "not authori[sz]ed to".to_string(),
    "access denied".to_string(),
  ]
}

fn default_unauthorized_statuses() -> Vec<u16> {
  vec![401, 403]
}

fn default_refresh_endpoint() -> String {
  "/auth/refresh".to_string()
}

fn default_sixty() -> u64 {
  60
}

fn default_page_limit() -> u64 {
  DEFAULT_PAGE_LIMIT
}

impl Config {
  /// Configuration pointing at `base_url` with every other field defaulted.
  pub fn for_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        refresh_endpoint: default_refresh_endpoint(),
      },
      cache: CacheConfig::default(),
      paging: PagingConfig::default(),
      id_field: default_id_field(),
      permission_denied_patterns: default_permission_denied_patterns(),
      unauthorized_statuses: default_unauthorized_statuses(),
      token_store: None,
      entities: Vec::new(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./crudsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/crudsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/crudsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("crudsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("crudsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.paging.default_page_limit == 0 {
      return Err(eyre!("paging.default_page_limit must be positive"));
    }
    Ok(config)
  }

  /// Where the session database lives.
  pub fn token_store_path(&self) -> Option<PathBuf> {
    self.token_store.clone().or_else(Database::default_path)
  }

  /// Access token from the environment, if set.
  pub fn env_access_token() -> Option<String> {
    std::env::var(ACCESS_TOKEN_ENV)
      .ok()
      .filter(|t| !t.is_empty())
  }
}
