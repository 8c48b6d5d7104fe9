use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

use crate::cache::{AssetPolicy, ManagerSettings, SqliteStorage, DEFAULT_ASSET_EXTENSIONS};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the manifest paths are served from (e.g. https://app.example.com)
  pub origin: Option<String>,
  /// Cache generation name; bump it to invalidate everything cached before
  pub version: String,
  /// Page served for navigations when offline
  pub offline_page: String,
  /// Paths pre-cached at install time
  pub manifest: Vec<String>,
  /// File extensions cached opportunistically (case-sensitive)
  pub asset_extensions: Vec<String>,
  /// Take over as soon as install finishes instead of waiting
  pub skip_waiting: bool,
  /// Cache database location (default: $XDG_DATA_HOME/offline-cache/cache.db)
  pub storage_path: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      version: "v1".to_string(),
      offline_page: "/offline.html".to_string(),
      manifest: vec![
        "/offline.html".to_string(),
        "/icons/icon-192.png".to_string(),
        "/icons/icon-512.png".to_string(),
      ],
      asset_extensions: DEFAULT_ASSET_EXTENSIONS
        .iter()
        .map(|e| e.to_string())
        .collect(),
      skip_waiting: true,
      storage_path: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-cache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
      None => {
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-cache").join("config.yaml");
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

    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
  }

  /// The configured origin, which must be an absolute http(s) URL.
  pub fn origin_url(&self) -> Result<Url> {
    let origin = self.origin.as_deref().ok_or_else(|| {
      eyre!("No origin configured. Set `origin` in the config file or pass --origin.")
    })?;

    let url = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be an http(s) URL, got '{}'", origin));
    }

    Ok(url)
  }

  /// Build the cache manager settings described by this configuration.
  pub fn manager_settings(&self) -> Result<ManagerSettings> {
    if !self.manifest.iter().any(|p| p == &self.offline_page) {
      warn!(
        page = %self.offline_page,
        "Offline page is not in the manifest; offline navigations may get a 503"
      );
    }

    let settings = ManagerSettings::new(
      self.version.clone(),
      self.origin_url()?,
      &self.offline_page,
      &self.manifest,
    )?
    .with_policy(AssetPolicy::new(self.asset_extensions.iter().cloned()))
    .with_skip_waiting(self.skip_waiting);

    Ok(settings)
  }

  /// Where the cache database lives.
  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage_path {
      Some(path) => Ok(expand_home(path)),
      None => SqliteStorage::default_path(),
    }
  }
}

fn expand_home(path: &Path) -> PathBuf {
  match (path.strip_prefix("~"), dirs::home_dir()) {
    (Ok(rest), Some(home)) => home.join(rest),
    _ => path.to_path_buf(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.version, "v1");
    assert_eq!(config.offline_page, "/offline.html");
    assert_eq!(config.manifest.len(), 3);
    assert_eq!(
      config.asset_extensions,
      vec!["js", "css", "png", "jpg", "svg", "woff", "woff2"]
    );
    assert!(config.skip_waiting);
  }

  #[test]
  fn test_load_partial_file_keeps_defaults() {
    let file = write_config("origin: https://contracts.example.com\nversion: v7\n");

    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.origin.as_deref(), Some("https://contracts.example.com"));
    assert_eq!(config.version, "v7");
    assert_eq!(config.manifest, Config::default().manifest);
  }

  #[test]
  fn test_load_full_file() {
    let file = write_config(
      r#"
origin: https://contracts.example.com
version: "2024-06"
offline_page: /offline/index.html
manifest:
  - /offline/index.html
  - /favicon.svg
asset_extensions: [js, css]
skip_waiting: false
storage_path: /tmp/offline-cache-test.db
"#,
    );

    let config = Config::load(Some(file.path())).unwrap();
    let settings = config.manager_settings().unwrap();

    assert_eq!(settings.version(), "2024-06");
    assert!(!settings.skip_waiting());
    assert_eq!(
      config.storage_path().unwrap(),
      PathBuf::from("/tmp/offline-cache-test.db")
    );
  }

  #[test]
  fn test_missing_explicit_file() {
    let err = Config::load(Some(Path::new("/nonexistent/offline-cache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_invalid_yaml() {
    let file = write_config("manifest: {not: [a list");
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_origin_required() {
    let config = Config::default();
    assert!(config.origin_url().is_err());
    assert!(config.manager_settings().is_err());
  }

  #[test]
  fn test_origin_must_be_http() {
    let config = Config {
      origin: Some("file:///srv/www".to_string()),
      ..Config::default()
    };
    assert!(config.origin_url().is_err());

    let config = Config {
      origin: Some("https://contracts.example.com".to_string()),
      ..Config::default()
    };
    assert_eq!(config.origin_url().unwrap().host_str(), Some("contracts.example.com"));
  }

  #[test]
  fn test_expand_home() {
    if let Some(home) = dirs::home_dir() {
      assert_eq!(expand_home(Path::new("~/cache.db")), home.join("cache.db"));
    }
    assert_eq!(expand_home(Path::new("/var/cache.db")), PathBuf::from("/var/cache.db"));
  }
}
