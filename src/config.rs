use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the CRM front end is served from; relative URLs resolve against it
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub lifecycle: LifecycleConfig,
  #[serde(default)]
  pub reminders: RemindersConfig,
  /// Remote CRM backend receiving pending writes (dry-run delivery if unset)
  pub remote: Option<RemoteConfig>,
  /// Database file (default: $XDG_DATA_HOME/pcrm-worker/worker.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Prefix of every partition tag
  pub prefix: String,
  /// Bump to invalidate every partition of the previous version on activation
  pub version: u32,
  /// Hosts besides the origin that get cache-first treatment (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub trusted_hosts: BTreeSet<String>,
  /// Assets pre-cached into the static partition on install
  pub manifest: Vec<String>,
  /// Page served to document requests when offline
  pub offline_document: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "persian-crm".to_string(),
      version: 1,
      trusted_hosts: DEFAULT_TRUSTED_HOSTS.iter().map(|h| h.to_string()).collect(),
      manifest: DEFAULT_MANIFEST.iter().map(|a| a.to_string()).collect(),
      offline_document: "/index.html".to_string(),
    }
  }
}

impl CacheConfig {
  pub fn static_tag(&self) -> String {
    format!("{}-static-v{}", self.prefix, self.version)
  }

  pub fn dynamic_tag(&self) -> String {
    format!("{}-dynamic-v{}", self.prefix, self.version)
  }

  /// Version name reported to the UI
  pub fn version_name(&self) -> String {
    format!("{}-v{}", self.prefix, self.version)
  }
}

const DEFAULT_TRUSTED_HOSTS: &[&str] = &[
  "cdn.tailwindcss.com",
  "cdn.jsdelivr.net",
  "cdnjs.cloudflare.com",
  "fonts.googleapis.com",
  "fonts.gstatic.com",
];

const DEFAULT_MANIFEST: &[&str] = &[
  "/",
  "/index.html",
  "/customers.html",
  "/sales.html",
  "/accounts.html",
  "/reminders.html",
  "/dashboard.html",
  "/main.js",
  "/resources/hero-bg.jpg",
  "/resources/user-avatar.jpg",
  "https://cdn.tailwindcss.com",
  "https://cdn.jsdelivr.net/npm/@fortawesome/fontawesome-free@6.0.0/css/all.min.css",
  "https://cdn.jsdelivr.net/npm/vazirmatn@33.0.3/Vazirmatn-font-face.min.css",
  "https://cdnjs.cloudflare.com/ajax/libs/animejs/3.2.1/anime.min.js",
  "https://cdnjs.cloudflare.com/ajax/libs/typed.js/2.0.12/typed.min.js",
  "https://cdn.jsdelivr.net/npm/echarts@5.4.0/dist/echarts.min.js",
  "https://cdnjs.cloudflare.com/ajax/libs/p5.js/1.4.0/p5.min.js",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate as soon as install succeeds instead of waiting for an activate event
  pub skip_waiting: bool,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self { skip_waiting: true }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemindersConfig {
  /// Delay before the first reminder scan after activation
  pub startup_delay_secs: u64,
  /// Reminders due within this window of a periodic check raise an urgent alert
  pub urgent_window_secs: u64,
  /// Emit a reminder check on this interval (unset: only on external triggers)
  pub check_interval_secs: Option<u64>,
}

impl Default for RemindersConfig {
  fn default() -> Self {
    Self {
      startup_delay_secs: 5,
      urgent_window_secs: 5 * 60,
      check_interval_secs: None,
    }
  }
}

impl RemindersConfig {
  pub fn startup_delay(&self) -> Duration {
    Duration::from_secs(self.startup_delay_secs)
  }

  pub fn urgent_window(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.urgent_window_secs as i64)
  }

  pub fn check_interval(&self) -> Option<Duration> {
    self
      .check_interval_secs
      .filter(|secs| *secs > 0)
      .map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL; records are POSTed to `<url>/<customers|sales|reminders>`
  pub url: Url,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// tracing filter directive, overridden by RUST_LOG
  pub filter: String,
  /// Write daily-rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
      directory: None,
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pcrm-worker.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pcrm-worker/config.yaml
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
        "No configuration file found. Create one at ~/.config/pcrm-worker/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pcrm-worker.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pcrm-worker").join("config.yaml");
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
    if config.cache.prefix.is_empty() {
      return Err(eyre!("cache.prefix must not be empty"));
    }
    Ok(config)
  }

  /// Get the remote API token from the environment.
  ///
  /// Checks PCRM_REMOTE_TOKEN; delivery is unauthenticated without it.
  pub fn remote_token() -> Option<String> {
    std::env::var("PCRM_REMOTE_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
