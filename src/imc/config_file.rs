//! Reader for the INI-style `cust.cfg` customization file

use crate::DatasourceError;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Flat view of a customization file. Every entry is keyed `SECTION|key`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    entries: BTreeMap<String, String>,
}

impl ConfigFile {
    /// Load from disk
    pub async fn load(path: &Path) -> Result<Self, DatasourceError> {
        info!("Parsing the config file {}", path.display());
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            DatasourceError::ParseFailure(format!("reading {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse file contents
    pub fn parse(content: &str) -> Result<Self, DatasourceError> {
        let mut entries = BTreeMap::new();
        let mut section: Option<String> = None;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| {
                    DatasourceError::ParseFailure(format!(
                        "line {}: unterminated section header '{}'",
                        lineno + 1,
                        line
                    ))
                })?;
                section = Some(name.trim().to_string());
                continue;
            }

            let (key, value) = split_entry(line).ok_or_else(|| {
                DatasourceError::ParseFailure(format!(
                    "line {}: expected 'key = value'",
                    lineno + 1
                ))
            })?;
            let section = section.as_deref().ok_or_else(|| {
                DatasourceError::ParseFailure(format!(
                    "line {}: entry outside of any section",
                    lineno + 1
                ))
            })?;

            let key = format!("{}|{}", section, key.trim());
            let value = value.trim().to_string();

            if is_sensitive(&key) {
                debug!("ADDED KEY-VAL :: '{}' = *****************", key);
            } else {
                debug!("ADDED KEY-VAL :: '{}' = '{}'", key, value);
            }
            entries.insert(key, value);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of keys starting with `prefix`
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.entries.keys().filter(|k| k.starts_with(prefix)).count()
    }
}

/// Split on the first `=` or `:`, whichever comes first
fn split_entry(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(['=', ':'])?;
    let (key, rest) = line.split_at(idx);
    if key.trim().is_empty() {
        return None;
    }
    Some((key, &rest[1..]))
}

/// Keys whose name begins with `-` hold secrets
fn is_sensitive(key: &str) -> bool {
    key.starts_with('-') || key.contains("|-")
}
