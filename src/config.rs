use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coursenotes::sync::RetryPolicy;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub sites: Vec<SiteConfig>,
  /// Site used when `--site` is not given
  pub default_site: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  /// Where the database and logs live (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
  pub id: String,
  pub url: String,
  /// Web-service token; falls back to environment variables
  pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Refetch live entries older than this
  pub max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_sync_interval")]
  pub interval_secs: u64,
  /// Drop an operation after this many failed replays
  pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
      max_attempts: None,
    }
  }
}

fn default_sync_interval() -> u64 {
  DEFAULT_SYNC_INTERVAL_SECS
}

fn default_request_timeout() -> u64 {
  DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./coursenotes.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/coursenotes/config.yaml
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
        "No configuration file found. Create one at ~/.config/coursenotes/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("coursenotes.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("coursenotes").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.sites.is_empty() {
      return Err(eyre!("at least one site must be configured"));
    }

    let mut seen = BTreeSet::new();
    for site in &self.sites {
      if !seen.insert(site.id.as_str()) {
        return Err(eyre!("site '{}' is configured twice", site.id));
      }
    }

    if let Some(default) = &self.default_site {
      if !seen.contains(default.as_str()) {
        return Err(eyre!("default_site '{}' is not a configured site", default));
      }
    }
    Ok(())
  }

  /// Pick the site named on the command line, else the default, else the only one.
  pub fn site(&self, selected: Option<&str>) -> Result<&SiteConfig> {
    let wanted = selected.or(self.default_site.as_deref());
    match wanted {
      Some(id) => self
        .sites
        .iter()
        .find(|site| site.id == id)
        .ok_or_else(|| eyre!("Unknown site '{}'", id)),
      None if self.sites.len() == 1 => Ok(&self.sites[0]),
      None => Err(eyre!(
        "Several sites are configured ({}); pick one with --site or set default_site",
        self
          .sites
          .iter()
          .map(|s| s.id.as_str())
          .collect::<Vec<_>>()
          .join(", ")
      )),
    }
  }

  /// Get the web-service token of a site.
  ///
  /// Checks the `token` field, then COURSENOTES_TOKEN_<SITE_ID>, then
  /// COURSENOTES_TOKEN.
  pub fn token(site: &SiteConfig) -> Result<String> {
    Self::token_from(site, |name| std::env::var(name).ok())
  }

  fn token_from(site: &SiteConfig, env: impl Fn(&str) -> Option<String>) -> Result<String> {
    if let Some(token) = &site.token {
      return Ok(token.clone());
    }

    let site_var = format!("COURSENOTES_TOKEN_{}", env_suffix(&site.id));
    env(&site_var)
      .or_else(|| env("COURSENOTES_TOKEN"))
      .ok_or_else(|| {
        eyre!(
          "No token for site '{}'. Set it in the config, or set {} or COURSENOTES_TOKEN.",
          site.id,
          site_var
        )
      })
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => dirs::data_dir()
        .map(|dir| dir.join("coursenotes"))
        .ok_or_else(|| eyre!("Cannot determine a data directory; set data_dir in the config")),
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync.interval_secs.max(1))
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.sync.max_attempts,
    }
  }

  pub fn cache_max_age(&self) -> Option<chrono::Duration> {
    self
      .cache
      .max_age_secs
      .and_then(|secs| i64::try_from(secs).ok())
      .map(chrono::Duration::seconds)
  }
}

/// `my-school.edu` -> `MY_SCHOOL_EDU`
fn env_suffix(site_id: &str) -> String {
  site_id
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() {
        c.to_ascii_uppercase()
      } else {
        '_'
      }
    })
    .collect()
}
