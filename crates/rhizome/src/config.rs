use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{IoContext, Result, RhizomeError};

pub const CONFIG_FILE_NAME: &str = "rhizome.toml";
pub const ENV_PREFIX: &str = "RHIZOME_";
pub const PROFILE_ENV: &str = "RHIZOME_PROFILE";
pub const LOG_ENV: &str = "RHIZOME_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub title: String,
    pub base_url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_taxonomies")]
    pub taxonomies: Vec<String>,
    #[serde(default)]
    pub drafts: bool,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub required_fields: Vec<String>,
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("content")
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("public")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".rhizome-cache")
}

fn default_taxonomies() -> Vec<String> {
    vec!["tags".to_string()]
}

/// Fully resolved configuration: the typed view plus the merged document it was
/// read from, which is what the config hash is computed over.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub site: SiteConfig,
    pub effective: Value,
}

/// Resolves `rhizome.toml`, then the active `[profiles.<name>]` table, then
/// `RHIZOME_*` environment overrides. Later layers win.
pub struct ConfigLoader {
    root: PathBuf,
    profile: Option<String>,
    env: Option<BTreeMap<String, String>>,
}

impl ConfigLoader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            profile: None,
            env: None,
        }
    }

    pub fn profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Replaces the process environment as the source of overrides.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn load(&self) -> Result<ResolvedConfig> {
        let config_path = self.root.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(RhizomeError::ConfigNotFound { path: config_path });
        }

        let content = fs::read_to_string(&config_path).io_context("reading config", &config_path)?;
        let table: toml::Table =
            toml::from_str(&content).map_err(|error| RhizomeError::Configuration {
                message: format!("{}: {error}", config_path.display()),
            })?;
        let mut effective =
            serde_json::to_value(table).map_err(|error| RhizomeError::Configuration {
                message: error.to_string(),
            })?;

        let env = self.environment();
        let profile = self
            .profile
            .clone()
            .or_else(|| env.get(PROFILE_ENV).cloned())
            .filter(|name| !name.is_empty());

        let profiles = match &mut effective {
            Value::Object(map) => map.remove("profiles"),
            _ => None,
        };
        if let Some(name) = &profile {
            let layer = profiles
                .as_ref()
                .and_then(|profiles| profiles.get(name))
                .ok_or_else(|| RhizomeError::UnknownProfile { name: name.clone() })?;
            debug!("applying profile '{name}'");
            merge_values(&mut effective, layer);
        }

        for (key, raw) in &env {
            let Some(path) = override_path(key) else {
                continue;
            };
            debug!("applying override {key}");
            set_path(&mut effective, &path, parse_override(raw))?;
        }

        if let Value::Object(map) = &mut effective {
            map.insert(
                "profile".to_string(),
                profile.map(Value::String).unwrap_or(Value::Null),
            );
        }

        let mut site: SiteConfig =
            serde_json::from_value(effective.clone()).map_err(|error| {
                RhizomeError::Configuration {
                    message: format!("{}: {error}", config_path.display()),
                }
            })?;
        site.base_url = site.base_url.trim_end_matches('/').to_string();

        Ok(ResolvedConfig { site, effective })
    }

    fn environment(&self) -> BTreeMap<String, String> {
        match &self.env {
            Some(env) => env.clone(),
            None => std::env::vars()
                .filter(|(key, _)| key.starts_with(ENV_PREFIX))
                .collect(),
        }
    }
}

fn override_path(key: &str) -> Option<Vec<String>> {
    if key == PROFILE_ENV || key == LOG_ENV {
        return None;
    }
    let rest = key.strip_prefix(ENV_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    Some(
        rest.split("__")
            .map(|segment| segment.to_lowercase())
            .collect(),
    )
}

fn parse_override(raw: &str) -> Value {
    toml::from_str::<toml::Table>(&format!("value = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("value"))
        .and_then(|value| serde_json::to_value(value).ok())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn set_path(target: &mut Value, path: &[String], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(());
    };
    let mut current = target;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => {
                return Err(RhizomeError::Configuration {
                    message: format!(
                        "override for '{}' crosses a non-table value",
                        path.join(".")
                    ),
                });
            }
        };
    }
    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        _ => Err(RhizomeError::Configuration {
            message: format!("override for '{}' crosses a non-table value", path.join(".")),
        }),
    }
}

/// Recursive merge; tables merge key by key, everything else is replaced.
fn merge_values(base: &mut Value, layer: &Value) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, layer) => *base = layer.clone(),
    }
}
