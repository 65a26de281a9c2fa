use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::{CachePolicy, Generation, SqliteStore, DEFAULT_EXCLUSIONS};

/// Variants compiled into the agent, one per hosted map application.
pub const BUILTIN_VARIANTS: &[&str] = &["gobojango_map", "lehututu_map"];

const DEFAULT_BASE_URL: &str = "http://localhost:8000/";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Root of the per-variant stores (default: $XDG_DATA_HOME/offline-agent)
  pub store_dir: Option<PathBuf>,
  /// Variant used when --variant is not given
  #[serde(default = "default_variant")]
  pub default_variant: String,
  #[serde(default)]
  pub logging: LoggingConfig,
  /// Extra or overriding variants, merged over the built-in ones
  #[serde(default)]
  pub variants: BTreeMap<String, VariantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Filter directive used when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Directory for daily-rolling log files; stderr only when unset
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

/// One agent instance: its generation, seed resources and origin.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VariantConfig {
  pub generation: Generation,
  pub seed_resources: Vec<String>,
  /// Locator substrings never stored (defaults to map-tile hosts)
  #[serde(default = "default_exclusions")]
  pub exclusions: Vec<String>,
  /// Origin relative locators resolve against
  #[serde(default = "default_base_url")]
  pub base_url: String,
}

fn default_variant() -> String {
  BUILTIN_VARIANTS[0].to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_exclusions() -> Vec<String> {
  DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect()
}

fn default_base_url() -> String {
  DEFAULT_BASE_URL.to_string()
}

impl VariantConfig {
  /// The built-in configuration for a map application.
  pub fn builtin(name: &str) -> Self {
    Self {
      generation: Generation::new(name, 1),
      seed_resources: vec![format!("./{}.html", name), format!("./{}_manifest.json", name)],
      exclusions: default_exclusions(),
      base_url: default_base_url(),
    }
  }

  pub fn policy(&self) -> CachePolicy {
    CachePolicy::new(self.generation.clone(), self.exclusions.clone())
  }
}

impl Default for Config {
  fn default() -> Self {
    let mut config = Self {
      store_dir: None,
      default_variant: default_variant(),
      logging: LoggingConfig::default(),
      variants: BTreeMap::new(),
    };
    config.merge_builtin_variants();
    config
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// An explicit path must exist. Otherwise the first of
  /// ./offline-agent.yaml and $XDG_CONFIG_HOME/offline-agent/config.yaml
  /// that exists is used, and without either the built-in variants apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      if !path.exists() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(path);
    }

    match Self::search_paths().into_iter().find(|p| p.exists()) {
      Some(path) => Self::load_from_path(&path),
      None => Ok(Self::default()),
    }
  }

  fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("offline-agent.yaml")];
    if let Some(config_dir) = dirs::config_dir() {
      paths.push(config_dir.join("offline-agent").join("config.yaml"));
    }
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config.merge_builtin_variants();

    Ok(config)
  }

  fn merge_builtin_variants(&mut self) {
    for name in BUILTIN_VARIANTS {
      self
        .variants
        .entry(name.to_string())
        .or_insert_with(|| VariantConfig::builtin(name));
    }
  }

  /// Name of the variant to drive: the given one or the configured default.
  pub fn variant_name<'a>(&'a self, name: Option<&'a str>) -> &'a str {
    name.unwrap_or(&self.default_variant)
  }

  /// Look up a variant, applying the OFFLINE_AGENT_BASE_URL override.
  pub fn variant(&self, name: Option<&str>) -> Result<VariantConfig> {
    let name = self.variant_name(name);
    let mut variant = self.variants.get(name).cloned().ok_or_else(|| {
      eyre!(
        "Unknown variant '{}'. Known variants: {}",
        name,
        self.variants.keys().cloned().collect::<Vec<_>>().join(", ")
      )
    })?;

    if let Ok(base_url) = std::env::var("OFFLINE_AGENT_BASE_URL") {
      if !base_url.is_empty() {
        variant.base_url = base_url;
      }
    }

    Ok(variant)
  }

  /// Database file of one variant's store.
  ///
  /// Every variant gets its own store, so reconciling one variant never
  /// touches the generations of another.
  pub fn store_path(&self, variant: &str) -> Result<PathBuf> {
    let dir = match &self.store_dir {
      Some(dir) => dir.clone(),
      None => SqliteStore::default_dir()?,
    };
    Ok(dir.join(variant).join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, LifecycleController};
  use crate::host::AgentHost;
  use crate::net::stub::StubNetwork;
  use crate::net::{Request, ResponseKind};
  use std::sync::Arc;

  fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, contents).unwrap();
    path
  }

  #[test]
  fn test_default_has_builtin_variants() {
    let config = Config::default();
    let variant = config.variant(Some("lehututu_map")).unwrap();

    assert_eq!(variant.generation.identifier(), "lehututu_map-v1");
    assert_eq!(
      variant.seed_resources,
      vec!["./lehututu_map.html", "./lehututu_map_manifest.json"]
    );
    assert_eq!(variant.exclusions, vec!["tile", "arcgis", "openstreetmap"]);
    assert_eq!(config.default_variant, "gobojango_map");
  }

  #[test]
  fn test_file_merges_over_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
      &dir,
      r#"
store_dir: /tmp/agent
logging:
  level: debug
variants:
  gobojango_map:
    generation: { name: gobojango_map, version: 3 }
    seed_resources: ["./gobojango_map.html"]
  survey:
    generation: { name: survey, version: 1 }
    seed_resources: []
    exclusions: ["mapbox"]
    base_url: https://survey.example/app/
"#,
    );

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(
      config.store_path("survey").unwrap(),
      PathBuf::from("/tmp/agent/survey/cache.db")
    );
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.variants.len(), 3);
    assert_eq!(
      config.variants["gobojango_map"].generation,
      Generation::new("gobojango_map", 3)
    );
    assert_eq!(config.variants["gobojango_map"].exclusions, default_exclusions());
    assert_eq!(
      config.variants["lehututu_map"],
      VariantConfig::builtin("lehututu_map")
    );
    assert_eq!(config.variants["survey"].exclusions, vec!["mapbox"]);
  }

  #[test]
  fn test_unknown_variant_is_an_error() {
    let err = Config::default().variant(Some("nowhere")).unwrap_err();
    assert!(err.to_string().contains("gobojango_map"));
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }

  #[test]
  fn test_malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "variants: [not, a, map]\n");

    let err = Config::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "default_variant: lehututu_map\n");

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.default_variant, "lehututu_map");
    assert_eq!(config.variant_name(None), "lehututu_map");
    assert_eq!(config.variants.len(), 2);
  }

  #[test]
  fn test_variants_get_separate_stores() {
    let config = Config::default();
    assert_ne!(
      config.store_path("gobojango_map").unwrap(),
      config.store_path("lehututu_map").unwrap()
    );
  }

  #[tokio::test]
  async fn test_activating_one_variant_keeps_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.store_dir = Some(dir.path().to_path_buf());

    let network = Arc::new(StubNetwork::new());
    for name in BUILTIN_VARIANTS {
      for seed in &config.variants[*name].seed_resources {
        network.route(seed, 200, ResponseKind::Basic, name);
      }
    }

    let mut stores = Vec::new();
    for name in BUILTIN_VARIANTS {
      let variant = config.variant(Some(*name)).unwrap();
      let store = Arc::new(SqliteStore::open(&config.store_path(name).unwrap()).unwrap());
      let controller = LifecycleController::new(
        Arc::clone(&store),
        Arc::clone(&network),
        variant.policy(),
        variant.seed_resources.clone(),
      );
      let host = AgentHost::new(controller, Arc::clone(&network));
      host.install().await.unwrap();
      host.activate().await.unwrap();
      stores.push(store);
    }

    assert_eq!(stores[0].keys().await.unwrap(), vec!["gobojango_map-v1"]);
    assert_eq!(stores[1].keys().await.unwrap(), vec!["lehututu_map-v1"]);

    let page = stores[0]
      .match_request(&Request::get("./gobojango_map.html"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(page.into_body(), "gobojango_map");
  }
}
