//! System config loader
//!
//! Loads `/etc/cloud/cloud.cfg` and the `cloud.cfg.d` drop-ins, merges them
//! and extracts the settings this datasource understands.

use super::SystemConfig;
use crate::{DatasourceError, state::OvfPaths};
use serde_yaml::Value;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// Load and merge the system config from standard locations
pub async fn load_system_config(paths: &OvfPaths) -> Result<SystemConfig, DatasourceError> {
    let mut merged = Value::Mapping(Default::default());

    // 1. Base config (/etc/cloud/cloud.cfg)
    if let Some(value) = load_config_file(paths.main_config()).await? {
        debug!("Loaded base config from {}", paths.main_config().display());
        merge_values(&mut merged, value);
    }

    // 2. Drop-in configs (/etc/cloud/cloud.cfg.d/*.cfg), later files win
    for value in load_dropin_configs(paths.config_d()).await? {
        merge_values(&mut merged, value);
    }

    serde_yaml::from_value(merged)
        .map_err(|e| DatasourceError::Config(format!("invalid system config: {}", e)))
}

/// Load a single config file as a YAML value
async fn load_config_file(path: impl AsRef<Path>) -> Result<Option<Value>, DatasourceError> {
    let path = path.as_ref();

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;

    match serde_yaml::from_str::<Value>(&content) {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Load all drop-in configs from a directory (sorted alphabetically)
async fn load_dropin_configs(dir: impl AsRef<Path>) -> Result<Vec<Value>, DatasourceError> {
    let dir = dir.as_ref();

    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "cfg") {
            entries.push(path);
        }
    }
    entries.sort();

    let mut values = Vec::new();
    for path in entries {
        if let Some(value) = load_config_file(&path).await? {
            debug!("Loaded drop-in config from {}", path.display());
            values.push(value);
        }
    }

    info!("Loaded {} drop-in configs", values.len());
    Ok(values)
}

/// Deep-merge `overlay` into `base`. Mappings merge recursively, anything
/// else is replaced.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
