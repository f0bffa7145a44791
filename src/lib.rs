//! OVF / VMware guest-customization datasource
//!
//! Discovers instance metadata handed to a VM by its hypervisor:
//!
//! - OVF environment documents (seed directory, guest-RPC, ISO9660 media)
//! - VMware guest customization packages (`cust.cfg` in the IMC directory)
//! - `seedfrom` redirection to local or remote meta-data
//!
//! The entry point is [`datasources::ovf::OvfDatasource::resolve`], which
//! returns a [`TransportResult`].

pub mod config;
pub mod datasources;
pub mod device;
pub mod imc;
pub mod network;
pub mod ovf;
pub mod platform;
pub mod seed;
pub mod state;

mod error;

pub use error::DatasourceError;

use network::NetworkConfig;
use std::collections::BTreeMap;

/// Free-form metadata or config keyed by property name
pub type Metadata = BTreeMap<String, serde_yaml::Value>;

/// Everything one acquisition attempt produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataBundle {
    pub metadata: Metadata,
    pub userdata: Option<Vec<u8>>,
    pub vendordata: Option<Vec<u8>>,
    /// Cloud-config style settings (password, timezone, ...)
    pub config: Metadata,
    pub network_config: Option<NetworkConfig>,
}

impl MetadataBundle {
    /// `instance-id` from the metadata
    pub fn instance_id(&self) -> Option<&str> {
        self.metadata.get("instance-id").and_then(|v| v.as_str())
    }
}

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq)]
pub enum TransportResult {
    NotFound,
    Found {
        /// Comma-separated provenance labels
        source: String,
        bundle: MetadataBundle,
    },
}

impl TransportResult {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found { .. })
    }

    pub fn bundle(&self) -> Option<&MetadataBundle> {
        match self {
            Self::Found { bundle, .. } => Some(bundle),
            Self::NotFound => None,
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Found { source, .. } => Some(source),
            Self::NotFound => None,
        }
    }
}
