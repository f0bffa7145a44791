//! OVF datasource
//!
//! Resolution order:
//! 1. an OVF environment in the seed directory
//! 2. a VMware customization package (on VMware, with the deployPkg plugin)
//! 3. the guest-RPC and ISO9660 transports
//!
//! A `seedfrom` property then redirects to further meta-data, and defaults are
//! filled in underneath.

use super::transport::{GuestInfoTransport, Iso9660Transport, OvfTransport};
use super::{Datasource, Dependency};
use crate::config::OvfSettings;
use crate::imc::password::{AccountManager, SystemAccounts};
use crate::imc::tools::{ToolboxCmd, ToolsConfig};
use crate::imc::{
    collect_imc_file_paths, poll_interval_for, search_file, wait_for_imc_cfg_file, ConfigFile,
    CustomizationConfig, CustomizationOutcome, CustomizationWorkflow, RpcStatusReporter,
    StatusReporter, CUST_CFG_FILE,
};
use crate::network::read_system_devices;
use crate::ovf::{find_ovf_env, read_ovf_environment};
use crate::platform::{DmiPlatform, PlatformInfo};
use crate::seed::read_seeded;
use crate::state::OvfPaths;
use crate::{DatasourceError, Metadata, MetadataBundle, TransportResult};
use async_trait::async_trait;
use serde_yaml::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Instance id used when no source provides one
pub const DEFAULT_INSTANCE_ID: &str = "iid-dsovf";

/// Provenance label of a VMware customization
pub const VMWARE_TOOLS_SOURCE: &str = "vmware-tools";

const DEPLOY_PKG_PLUGIN: &str = "libdeployPkgPlugin.so";

const DEPLOY_PKG_PLUGIN_DIRS: [&str; 6] = [
    "/usr/lib/vmware-tools",
    "/usr/lib64/vmware-tools",
    "/usr/lib/open-vm-tools",
    "/usr/lib64/open-vm-tools",
    "/usr/lib/x86_64-linux-gnu/open-vm-tools",
    "/usr/lib/aarch64-linux-gnu/open-vm-tools",
];

/// The two registered variants of the datasource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvfFlavor {
    /// Local only
    Ovf,
    /// May redirect to the network
    OvfNet,
}

impl OvfFlavor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ovf => "OVF",
            Self::OvfNet => "OVFNet",
        }
    }

    /// Directory below the cloud seed dir
    pub fn seed_subdir(&self) -> &'static str {
        match self {
            Self::Ovf => "ovf",
            Self::OvfNet => "ovf-net",
        }
    }

    /// Accepted `seedfrom` prefixes
    pub fn supported_seed_starts(&self) -> &'static [&'static str] {
        match self {
            Self::Ovf => &["/", "file://"],
            Self::OvfNet => &["http://", "https://"],
        }
    }

    pub fn vmware_customization_supported(&self) -> bool {
        matches!(self, Self::Ovf)
    }

    pub fn dependencies(&self) -> &'static [Dependency] {
        match self {
            Self::Ovf => &[Dependency::Filesystem],
            Self::OvfNet => &[Dependency::Filesystem, Dependency::Network],
        }
    }
}

/// Collaborators of the VMware customization path
pub struct VmwareServices {
    pub reporter: Box<dyn StatusReporter>,
    pub tools: Box<dyn ToolsConfig>,
    pub accounts: Box<dyn AccountManager>,
    /// Override of the cust.cfg poll interval
    pub poll_interval: Option<Duration>,
    pub nic_enable_wait: Duration,
}

impl Default for VmwareServices {
    fn default() -> Self {
        Self {
            reporter: Box::new(RpcStatusReporter::new()),
            tools: Box::new(ToolboxCmd),
            accounts: Box::new(SystemAccounts),
            poll_interval: None,
            nic_enable_wait: Duration::from_secs(1),
        }
    }
}

/// OVF / OVFNet datasource
pub struct OvfDatasource {
    flavor: OvfFlavor,
    paths: OvfPaths,
    settings: OvfSettings,
    platform: Box<dyn PlatformInfo>,
    transports: Vec<Box<dyn OvfTransport>>,
    vmware: VmwareServices,
}

impl OvfDatasource {
    pub fn new(flavor: OvfFlavor, paths: OvfPaths, settings: OvfSettings) -> Self {
        let platform = Box::new(DmiPlatform::new(paths.dmi_product_name()));
        Self {
            flavor,
            paths,
            settings,
            platform,
            transports: vec![
                Box::new(GuestInfoTransport::default()),
                Box::new(Iso9660Transport),
            ],
            vmware: VmwareServices::default(),
        }
    }

    pub fn with_platform(mut self, platform: impl PlatformInfo + 'static) -> Self {
        self.platform = Box::new(platform);
        self
    }

    pub fn with_transports(mut self, transports: Vec<Box<dyn OvfTransport>>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_vmware_services(mut self, services: VmwareServices) -> Self {
        self.vmware = services;
        self
    }

    pub fn flavor(&self) -> OvfFlavor {
        self.flavor
    }

    pub fn settings(&self) -> &OvfSettings {
        &self.settings
    }

    /// Run the full resolution
    pub async fn resolve(&self) -> Result<TransportResult, DatasourceError> {
        let mut found: Vec<String> = Vec::new();
        let mut bundle = MetadataBundle::default();

        if let Some((label, seeded)) = self.read_seed_dir().await {
            bundle = seeded;
            found.push(label);
        }

        if found.is_empty() && self.platform.is_vmware().await {
            debug!("VMware Virtualization Platform found");
            match self.vmware_customization().await {
                Ok(Some(outcome)) => {
                    bundle = outcome.bundle;
                    found.push(VMWARE_TOOLS_SOURCE.to_string());
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("VMware customization unavailable: {}", e),
            }
        }

        if found.is_empty() {
            if let Some((label, transported)) = self.read_transports().await? {
                bundle = transported;
                found.push(label);
            }
        }

        if found.is_empty() {
            debug!("No OVF transport found");
            return Ok(TransportResult::NotFound);
        }

        if let Some(seedfrom) = seedfrom(&bundle.metadata) {
            if !self
                .flavor
                .supported_seed_starts()
                .iter()
                .any(|scheme| seedfrom.starts_with(scheme))
            {
                debug!("Seed from {} not supported by {}", seedfrom, self.flavor.name());
                return Err(DatasourceError::UnsupportedSeedScheme(seedfrom));
            }

            let seed = read_seeded(&seedfrom).await?;
            debug!("Using seeded cache data from {}", seedfrom);
            bundle.metadata.extend(seed.metadata);
            bundle.userdata = seed.userdata;
            bundle.vendordata = seed.vendordata;
            found.push(seedfrom);
        }

        bundle
            .metadata
            .entry("instance-id".to_string())
            .or_insert_with(|| Value::String(DEFAULT_INSTANCE_ID.to_string()));

        let source = found.join(",");
        info!("{} found data from {}", self.flavor.name(), source);
        Ok(TransportResult::Found { source, bundle })
    }

    async fn read_seed_dir(&self) -> Option<(String, MetadataBundle)> {
        let seed_dir = self.paths.seed_dir().join(self.flavor.seed_subdir());
        let (name, contents) = find_ovf_env(&seed_dir).await?;
        let seed_path = seed_dir.join(&name);

        match read_ovf_environment(&contents, false) {
            Ok(env) => Some((
                seed_path.display().to_string(),
                MetadataBundle {
                    metadata: env.metadata,
                    userdata: env.userdata,
                    vendordata: None,
                    config: env.config,
                    network_config: None,
                },
            )),
            Err(e) => {
                warn!("Ignoring seed {}: {}", seed_path.display(), e);
                None
            }
        }
    }

    async fn read_transports(&self) -> Result<Option<(String, MetadataBundle)>, DatasourceError> {
        for transport in &self.transports {
            let contents = match transport.fetch().await {
                Ok(Some(contents)) if !contents.is_empty() => contents,
                Ok(_) => continue,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("Transport {} failed: {}", transport.name(), e);
                    continue;
                }
            };

            match read_ovf_environment(&contents, true) {
                Ok(env) => {
                    let network_config = env.network_config();
                    return Ok(Some((
                        transport.name().to_string(),
                        MetadataBundle {
                            metadata: env.metadata,
                            userdata: env.userdata,
                            vendordata: None,
                            config: env.config,
                            network_config,
                        },
                    )));
                }
                Err(e) => warn!("Ignoring OVF environment from {}: {}", transport.name(), e),
            }
        }
        Ok(None)
    }

    /// The VMware branch. `Ok(None)` means nothing applicable was found and
    /// resolution goes on with the transports.
    async fn vmware_customization(&self) -> Result<Option<CustomizationOutcome>, DatasourceError> {
        let settings = &self.settings;
        if !(settings.allow_vmware_cust || settings.allow_raw_data) {
            debug!("Customization for VMware platform is disabled.");
            return Ok(None);
        }

        let Some(plugin) = self.find_deploy_pkg_plugin() else {
            debug!("Did not find the customization plugin.");
            return Ok(None);
        };
        debug!("Found the customization plugin at {}", plugin.display());

        let imc_dir = self.paths.imc_dir();
        let poll = self
            .vmware
            .poll_interval
            .unwrap_or_else(|| poll_interval_for(settings.max_wait));
        let Some(cfg_path) = wait_for_imc_cfg_file(&imc_dir, CUST_CFG_FILE, settings.max_wait, poll).await
        else {
            debug!("Did not find VMware Customization Config File");
            return Ok(None);
        };
        debug!("Found VMware Customization Config File at {}", cfg_path.display());

        let system_devices = read_system_devices(&self.paths.sys_class_net())
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to read network devices: {}", e);
                Default::default()
            });

        let workflow = CustomizationWorkflow::new(
            &self.paths,
            settings,
            self.vmware.reporter.as_ref(),
            self.vmware.tools.as_ref(),
            self.vmware.accounts.as_ref(),
            system_devices,
        )
        .with_nic_enable_wait(self.vmware.nic_enable_wait);

        let conf = match load_customization_config(&cfg_path).await {
            Ok(conf) => conf,
            Err(e) => return Err(workflow.fail_config_parse(e).await),
        };

        let files = match collect_imc_file_paths(&conf, &imc_dir).await {
            Ok(files) => files,
            Err(e) => return Err(workflow.fail_missing_files(&conf, e).await),
        };

        if files.metadata.is_some() && !settings.allow_raw_data {
            debug!("Customization using raw data is disabled.");
            return Ok(None);
        }
        if files.metadata.is_none() && !settings.allow_vmware_cust {
            debug!("Customization using VMware config is disabled.");
            return Ok(None);
        }

        workflow.run(&conf, &files).await.map(Some)
    }

    fn find_deploy_pkg_plugin(&self) -> Option<std::path::PathBuf> {
        DEPLOY_PKG_PLUGIN_DIRS
            .iter()
            .find_map(|dir| search_file(&self.paths.rooted(dir), DEPLOY_PKG_PLUGIN))
    }

    /// `vmware (<source>)` on a plain VMware product name, else `ovf (<source>)`
    pub async fn subplatform(&self, source: &str) -> String {
        let product = self
            .platform
            .system_product_name()
            .await
            .map(|p| p.to_lowercase());
        if product.as_deref() == Some("vmware") {
            format!("vmware ({})", source)
        } else {
            format!("ovf ({})", source)
        }
    }
}

async fn load_customization_config(
    path: &std::path::Path,
) -> Result<CustomizationConfig, DatasourceError> {
    let cf = ConfigFile::load(path).await?;
    CustomizationConfig::from_config_file(&cf)
}

fn seedfrom(metadata: &Metadata) -> Option<String> {
    metadata
        .get("seedfrom")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// `public-keys` as a list, whether given as one string or several
pub fn public_ssh_keys(metadata: &Metadata) -> Vec<String> {
    match metadata.get("public-keys") {
        Some(Value::String(key)) => vec![key.clone()],
        Some(Value::Sequence(keys)) => keys
            .iter()
            .filter_map(|k| k.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Datasource for OvfDatasource {
    fn name(&self) -> &'static str {
        self.flavor.name()
    }

    async fn get_data(&self) -> Result<TransportResult, DatasourceError> {
        self.resolve().await
    }

    /// Once configured through OVF the instance id is treated as stable, so
    /// clones keep their configuration.
    fn check_instance_id(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FixedPlatform;
    use tempfile::TempDir;

    #[test]
    fn test_flavors() {
        assert_eq!(OvfFlavor::Ovf.name(), "OVF");
        assert_eq!(OvfFlavor::OvfNet.seed_subdir(), "ovf-net");
        assert!(OvfFlavor::Ovf.vmware_customization_supported());
        assert!(!OvfFlavor::OvfNet.vmware_customization_supported());
        assert_eq!(
            OvfFlavor::OvfNet.supported_seed_starts(),
            &["http://", "https://"]
        );
    }

    #[test]
    fn test_public_ssh_keys() {
        let mut md = Metadata::new();
        assert!(public_ssh_keys(&md).is_empty());

        md.insert("public-keys".into(), Value::from("ssh-rsa AAAA"));
        assert_eq!(public_ssh_keys(&md), vec!["ssh-rsa AAAA"]);

        md.insert(
            "public-keys".into(),
            Value::Sequence(vec![Value::from("ssh-rsa A"), Value::from("ssh-ed25519 B")]),
        );
        assert_eq!(public_ssh_keys(&md), vec!["ssh-rsa A", "ssh-ed25519 B"]);
    }

    #[tokio::test]
    async fn test_subplatform() {
        let tmp = TempDir::new().unwrap();
        let paths = OvfPaths::with_root(tmp.path());
        let ds = OvfDatasource::new(OvfFlavor::Ovf, paths.clone(), OvfSettings::default())
            .with_platform(FixedPlatform::new("VMware"));
        assert_eq!(ds.subplatform("iso").await, "vmware (iso)");

        let ds = OvfDatasource::new(OvfFlavor::Ovf, paths, OvfSettings::default())
            .with_platform(FixedPlatform::new("VMware Virtual Platform"));
        assert_eq!(ds.subplatform("iso").await, "ovf (iso)");
    }

    #[test]
    fn test_check_instance_id() {
        let ds = OvfDatasource::new(OvfFlavor::Ovf, OvfPaths::new(), OvfSettings::default());
        assert!(ds.check_instance_id());
    }
}
