//! Datasource configuration
//!
//! Settings come from the system cloud config (`/etc/cloud/cloud.cfg` and
//! its drop-ins). They are resolved once into an [`OvfSettings`] value that is
//! handed to the datasource; nothing reads configuration globally.

pub mod loader;

use crate::datasources::ovf::OvfFlavor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Default time to wait for the VMware customization config file, in seconds
pub const DEFAULT_MAX_WAIT_SECS: u64 = 15;

const MAX_WAIT_OPTION: &str = "vmware_cust_file_max_wait";

/// The parts of the system cloud config this datasource understands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Global switch for VMware customization through the IMC config file
    pub disable_vmware_customization: bool,

    /// Per-datasource sections, keyed by datasource name ("OVF", "OVFNet").
    /// Only the section for the running flavor is interpreted.
    pub datasource: BTreeMap<String, serde_yaml::Value>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            disable_vmware_customization: true,
            datasource: BTreeMap::new(),
        }
    }
}

/// `datasource.OVF` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OvfDatasourceConfig {
    /// Accept cloud-init meta-data/user-data shipped in the customization package
    pub allow_raw_data: bool,

    /// Seconds to wait for cust.cfg. Kept loosely typed so that bad values
    /// fall back to the default instead of failing the whole config.
    pub vmware_cust_file_max_wait: Option<serde_yaml::Value>,

    /// Run custom scripts named by the customization config
    pub allow_custom_scripts: bool,

    /// OS family handed to the NIC configure step (e.g. "debian")
    pub os_family: Option<String>,
}

impl Default for OvfDatasourceConfig {
    fn default() -> Self {
        Self {
            allow_raw_data: true,
            vmware_cust_file_max_wait: None,
            allow_custom_scripts: true,
            os_family: None,
        }
    }
}

/// Resolved settings for one datasource instance
#[derive(Debug, Clone)]
pub struct OvfSettings {
    /// Customization through the VMware IMC config file is allowed
    pub allow_vmware_cust: bool,
    /// Customization through raw cloud-init data is allowed
    pub allow_raw_data: bool,
    /// Upper bound on the wait for cust.cfg
    pub max_wait: Duration,
    /// Custom pre/post scripts may run
    pub allow_custom_scripts: bool,
    /// OS family for the NIC configure step
    pub os_family: Option<String>,
}

impl Default for OvfSettings {
    fn default() -> Self {
        Self::from_system_config(&SystemConfig::default(), OvfFlavor::Ovf)
    }
}

impl OvfSettings {
    /// Resolve settings for a datasource flavor
    pub fn from_system_config(cfg: &SystemConfig, flavor: OvfFlavor) -> Self {
        let ds_cfg: OvfDatasourceConfig = match cfg.datasource.get(flavor.name()) {
            Some(value) => serde_yaml::from_value(value.clone()).unwrap_or_else(|e| {
                warn!("Ignoring invalid datasource.{} config: {}", flavor.name(), e);
                OvfDatasourceConfig::default()
            }),
            None => OvfDatasourceConfig::default(),
        };

        let (allow_vmware_cust, allow_raw_data) = if flavor.vmware_customization_supported() {
            (!cfg.disable_vmware_customization, ds_cfg.allow_raw_data)
        } else {
            (false, false)
        };

        Self {
            allow_vmware_cust,
            allow_raw_data,
            max_wait: Duration::from_secs(max_wait_from_cfg(
                ds_cfg.vmware_cust_file_max_wait.as_ref(),
            )),
            allow_custom_scripts: ds_cfg.allow_custom_scripts,
            os_family: ds_cfg.os_family,
        }
    }
}

/// Interpret `vmware_cust_file_max_wait`, falling back to the default for
/// anything that is not a non-negative integer.
pub fn max_wait_from_cfg(value: Option<&serde_yaml::Value>) -> u64 {
    let Some(value) = value else {
        return DEFAULT_MAX_WAIT_SECS;
    };

    let parsed = match value {
        serde_yaml::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_yaml::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    match parsed {
        Some(secs) if secs >= 0 => secs as u64,
        Some(secs) => {
            warn!(
                "Invalid value '{}' for '{}', using '{}' instead",
                secs, MAX_WAIT_OPTION, DEFAULT_MAX_WAIT_SECS
            );
            DEFAULT_MAX_WAIT_SECS
        }
        None => {
            warn!(
                "Failed to get '{}', using {}",
                MAX_WAIT_OPTION, DEFAULT_MAX_WAIT_SECS
            );
            DEFAULT_MAX_WAIT_SECS
        }
    }
}
