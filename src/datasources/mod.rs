//! Datasource registration
//!
//! The orchestrator asks for the datasources that can run with a given set of
//! capabilities (filesystem, network) and decides the order in which they are
//! tried. This crate only provides the OVF flavors and their resolution logic.

pub mod ovf;
pub mod transport;

use crate::config::{OvfSettings, SystemConfig};
use crate::state::OvfPaths;
use crate::{DatasourceError, TransportResult};
use async_trait::async_trait;
use ovf::{OvfDatasource, OvfFlavor};

/// Capability a datasource needs before it can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependency {
    Filesystem,
    Network,
}

/// Trait for metadata datasources
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Name of this datasource (e.g., "OVF")
    fn name(&self) -> &'static str;

    /// Look for instance data. `NotFound` is not an error.
    async fn get_data(&self) -> Result<TransportResult, DatasourceError>;

    /// Whether cached data still belongs to this instance
    fn check_instance_id(&self) -> bool {
        false
    }
}

/// Builds a datasource from the shared path layout and system config
pub type Constructor = fn(&OvfPaths, &SystemConfig) -> Box<dyn Datasource>;

/// One row of the registration table
pub struct Registration {
    pub name: &'static str,
    pub depends: &'static [Dependency],
    pub build: Constructor,
}

fn build_ovf(paths: &OvfPaths, cfg: &SystemConfig) -> Box<dyn Datasource> {
    build_flavor(OvfFlavor::Ovf, paths, cfg)
}

fn build_ovf_net(paths: &OvfPaths, cfg: &SystemConfig) -> Box<dyn Datasource> {
    build_flavor(OvfFlavor::OvfNet, paths, cfg)
}

fn build_flavor(flavor: OvfFlavor, paths: &OvfPaths, cfg: &SystemConfig) -> Box<dyn Datasource> {
    let settings = OvfSettings::from_system_config(cfg, flavor);
    Box::new(OvfDatasource::new(flavor, paths.clone(), settings))
}

/// All datasources provided by this crate
pub const DATASOURCES: &[Registration] = &[
    Registration {
        name: "OVF",
        depends: &[Dependency::Filesystem],
        build: build_ovf,
    },
    Registration {
        name: "OVFNet",
        depends: &[Dependency::Filesystem, Dependency::Network],
        build: build_ovf_net,
    },
];

/// Datasources whose dependencies are exactly `depends`
pub fn datasource_list(depends: &[Dependency]) -> Vec<&'static Registration> {
    let mut wanted = depends.to_vec();
    wanted.sort();
    wanted.dedup();

    DATASOURCES
        .iter()
        .filter(|reg| {
            let mut have = reg.depends.to_vec();
            have.sort();
            have == wanted
        })
        .collect()
}
