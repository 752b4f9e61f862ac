use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Agent configuration, resolved once at startup and immutable afterwards.
/// A new version of the agent is a new `AgentConfig`, never a mutation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
  /// Origin the application is served from
  pub origin: Url,
  /// Sub-path prefix applied to every cached or opened URL (e.g. "/app")
  pub base_path: String,
  /// Name of the current cache store; doubles as the agent version
  pub cache_name: String,
  /// Paths (relative to `base_path`) fetched and cached on install
  pub manifest: Vec<String>,
  pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
  /// Title used for push notifications
  pub title: String,
  /// Body used when a push arrives without a payload
  pub default_body: String,
  /// Icon and badge path, relative to `base_path`
  pub icon: String,
  /// Passed through to the notification surface untouched
  pub vibrate: Vec<u32>,
  /// Opaque payload attached to every notification
  pub primary_key: serde_json::Value,
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:3000").expect("static url"),
      base_path: "/nextjspwaexample".to_string(),
      cache_name: "nextjs-pwa-v1".to_string(),
      manifest: vec![
        "/".to_string(),
        "/manifest.json".to_string(),
        "/icon-192x192.png".to_string(),
        "/icon-384x384.png".to_string(),
        "/icon-512x512.png".to_string(),
      ],
      notifications: NotificationConfig::default(),
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Next.js PWA".to_string(),
      default_body: "New notification from PWA".to_string(),
      icon: "/icon-192x192.png".to_string(),
      vibrate: vec![200, 100, 200],
      primary_key: serde_json::Value::from(1),
    }
  }
}

impl AgentConfig {
  /// Load configuration from file, falling back to built-in defaults.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.normalized()
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: AgentConfig = serde_yaml::from_str(contents)?;
    config.normalized()
  }

  /// Canonicalize `base_path` to "" or "/segment" and check the rest.
  pub fn normalized(mut self) -> Result<Self> {
    let trimmed = self.base_path.trim().trim_end_matches('/');
    self.base_path = if trimmed.is_empty() || trimmed.starts_with('/') {
      trimmed.to_string()
    } else {
      format!("/{}", trimmed)
    };

    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    if self.origin.cannot_be_a_base() {
      return Err(eyre!("origin must be an absolute http(s) url: {}", self.origin));
    }

    Ok(self)
  }

  /// Resolve a path under the base path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    let path = if path.starts_with('/') {
      path.to_string()
    } else {
      format!("/{}", path)
    };

    self
      .origin
      .join(&format!("{}{}", self.base_path, path))
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  /// Root of the application; also the offline fallback for navigations.
  pub fn shell_url(&self) -> Result<Url> {
    self.resolve("/")
  }

  /// Where the page layer registers the agent script.
  pub fn script_url(&self) -> Result<Url> {
    self.resolve("/sw.js")
  }

  pub fn icon_url(&self) -> Result<Url> {
    self.resolve(&self.notifications.icon)
  }

  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self.manifest.iter().map(|p| self.resolve(p)).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_use_sub_path() {
    let config = AgentConfig::default().normalized().unwrap();
    assert_eq!(
      config.shell_url().unwrap().as_str(),
      "http://localhost:3000/nextjspwaexample/"
    );
    assert_eq!(
      config.script_url().unwrap().as_str(),
      "http://localhost:3000/nextjspwaexample/sw.js"
    );
    assert_eq!(config.manifest_urls().unwrap().len(), 5);
  }

  #[test]
  fn test_base_path_is_normalized() {
    for (raw, expected) in [("", ""), ("/", ""), ("app/", "/app"), ("/app", "/app")] {
      let config = AgentConfig {
        base_path: raw.to_string(),
        ..AgentConfig::default()
      }
      .normalized()
      .unwrap();
      assert_eq!(config.base_path, expected, "for {:?}", raw);
    }
  }

  #[test]
  fn test_root_base_path_resolves_to_origin() {
    let config = AgentConfig {
      base_path: String::new(),
      ..AgentConfig::default()
    };
    assert_eq!(
      config.resolve("manifest.json").unwrap().as_str(),
      "http://localhost:3000/manifest.json"
    );
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = AgentConfig::from_yaml(
      "base_path: /shop/\ncache_name: shop-v2\nnotifications:\n  title: Shop\n",
    )
    .unwrap();

    assert_eq!(config.base_path, "/shop");
    assert_eq!(config.cache_name, "shop-v2");
    assert_eq!(config.notifications.title, "Shop");
    assert_eq!(config.notifications.default_body, "New notification from PWA");
    assert_eq!(config.manifest.len(), 5);
  }

  #[test]
  fn test_example_config_matches_defaults() {
    let config = AgentConfig::from_yaml(include_str!("../config.example.yaml")).unwrap();
    assert_eq!(config, AgentConfig::default().normalized().unwrap());
  }

  #[test]
  fn test_empty_cache_name_rejected() {
    assert!(AgentConfig::from_yaml("cache_name: ''").is_err());
  }

  #[test]
  fn test_missing_explicit_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(AgentConfig::load(Some(&missing)).is_err());
  }

  #[test]
  fn test_load_from_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "origin: https://example.org\nbase_path: ''\n").unwrap();

    let config = AgentConfig::load(Some(&path)).unwrap();
    assert_eq!(config.shell_url().unwrap().as_str(), "https://example.org/");
  }
}
