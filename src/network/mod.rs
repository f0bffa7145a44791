//! Network configuration handed to the rendering stage
//!
//! Either a v1 document generated here (from IMC NIC descriptors or the DHCP
//! fallback) or a structured document shipped verbatim by the platform.

pub mod v1;

use crate::DatasourceError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;
use v1::{ConfigItem, NetworkConfigV1, PhysicalConfig, SubnetConfig};

/// Network configuration produced by the datasource
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NetworkConfig {
    /// Version 1 document generated by this crate
    Generated(NetworkConfigV1),
    /// Document taken as-is from OVF properties or raw IMC metadata
    Document(serde_yaml::Value),
}

/// Present network devices keyed by lower-cased MAC address
pub type SystemDevices = BTreeMap<String, String>;

/// Read `<sys_class_net>/<dev>/address` for every device except loopback
pub async fn read_system_devices(sys_class_net: &Path) -> Result<SystemDevices, DatasourceError> {
    let mut devices = SystemDevices::new();

    let mut entries = fs::read_dir(sys_class_net).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        let Ok(address) = fs::read_to_string(entry.path().join("address")).await else {
            continue;
        };
        let mac = address.trim().to_lowercase();
        if mac.is_empty() || mac == "00:00:00:00:00:00" {
            continue;
        }
        debug!("Found network device {} ({})", name, mac);
        devices.insert(mac, name);
    }

    Ok(devices)
}

/// DHCP on a single device, preferring eth0 and otherwise the first device
/// by name. `None` when no device is present.
pub fn fallback_config(devices: &SystemDevices) -> Option<NetworkConfig> {
    let (mac, name) = devices
        .iter()
        .find(|(_, name)| name.as_str() == "eth0")
        .or_else(|| devices.iter().min_by(|a, b| a.1.cmp(b.1)))?;

    debug!("Generated fallback network config for {}", name);
    Some(NetworkConfig::Generated(NetworkConfigV1 {
        version: 1,
        config: vec![ConfigItem::Physical(PhysicalConfig {
            name: name.clone(),
            mac_address: Some(mac.clone()),
            subnets: vec![SubnetConfig {
                subnet_type: "dhcp".to_string(),
                ..Default::default()
            }],
        })],
    }))
}
