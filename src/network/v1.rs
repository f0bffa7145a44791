//! Network config v1 types
//!
//! The list-of-records format produced for the network rendering stage.

use crate::DatasourceError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Network config v1 document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfigV1 {
    /// Version (always 1)
    pub version: u8,
    /// Network configuration items
    #[serde(default)]
    pub config: Vec<ConfigItem>,
}

/// Individual configuration item in v1 format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConfigItem {
    /// Physical network interface
    #[serde(rename = "physical")]
    Physical(PhysicalConfig),
    /// Nameserver configuration
    #[serde(rename = "nameserver")]
    Nameserver(NameserverConfigV1),
}

/// Physical interface configuration (v1)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicalConfig {
    /// Interface name
    pub name: String,
    /// MAC address for matching
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Subnets (IP configuration)
    #[serde(default)]
    pub subnets: Vec<SubnetConfig>,
}

/// Subnet/IP configuration (v1)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// Subnet type: static, static6, dhcp, manual
    #[serde(rename = "type")]
    pub subnet_type: String,
    /// "auto" when the interface comes up at boot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<String>,
    /// IP address (for static)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Network prefix/netmask
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    /// Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfigV1>,
}

/// Nameserver configuration (v1)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameserverConfigV1 {
    /// DNS server addresses
    #[serde(default)]
    pub address: Vec<String>,
    /// Search domains
    #[serde(default)]
    pub search: Vec<String>,
}

/// Route configuration (v1)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfigV1 {
    /// Destination network
    pub destination: Option<String>,
    /// Gateway
    pub gateway: Option<String>,
    /// Metric
    pub metric: Option<u32>,
}

impl NetworkConfigV1 {
    /// Wrap per-device records into a document, appending a single
    /// nameserver record when there is anything to put in it.
    pub fn from_records(
        mut records: Vec<ConfigItem>,
        nameservers: &[String],
        search: &[String],
    ) -> Self {
        if !nameservers.is_empty() || !search.is_empty() {
            records.push(ConfigItem::Nameserver(NameserverConfigV1 {
                address: nameservers.to_vec(),
                search: search.to_vec(),
            }));
        }

        Self {
            version: 1,
            config: records,
        }
    }
}

/// Prefix length of a dotted-decimal netmask or a bare prefix.
///
/// The mask must be contiguous and the prefix at most 32.
pub fn netmask_to_prefix(netmask: &str) -> Result<u8, DatasourceError> {
    let netmask = netmask.trim();
    let invalid = || DatasourceError::ParseFailure(format!("invalid IPv4 netmask '{}'", netmask));

    if let Ok(prefix) = netmask.parse::<u8>() {
        return if prefix <= 32 { Ok(prefix) } else { Err(invalid()) };
    }

    let bits = u32::from(netmask.parse::<Ipv4Addr>().map_err(|_| invalid())?);
    if bits.leading_ones() + bits.trailing_zeros() != 32 {
        return Err(invalid());
    }
    Ok(bits.leading_ones() as u8)
}
