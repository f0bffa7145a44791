//! The customization run driven by an IMC package
//!
//! A run either loads raw cloud-init data shipped with the package or applies
//! a classic VMware customization spec (host name, NICs, passwords, scripts).
//! Any failing step reports its status to the platform, removes the IMC
//! directory and aborts the run with a fatal [`DatasourceError::Customization`].

use super::config::CustomizationConfig;
use super::nic::{self, NicConfigurator};
use super::password::{AccountManager, PasswordConfigurator};
use super::script::CustomScript;
use super::status::{
    self, GuestCustError, GuestCustEvent, GuestCustState, StatusCode, StatusReporter,
};
use super::tools::ToolsConfig;
use super::{nics_to_enable, ImcFileSet};
use crate::config::OvfSettings;
use crate::network::{fallback_config, NetworkConfig, SystemDevices};
use crate::state::{MarkerStore, OvfPaths};
use crate::{DatasourceError, Metadata, MetadataBundle};
use serde_yaml::Value;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// Instance id of a classic VMware customization
pub const IMC_INSTANCE_ID: &str = "iid-vmware-imc";

const TOOLS_CUST_SECTION: &str = "deployPkg";
const TOOLS_ENABLE_CUST_SCRIPTS: &str = "enable-custom-scripts";

const STEP_MISSING_FILES: &str = "File(s) missing in directory";
const STEP_PARSE_METADATA: &str = "Error parsing the cloud-init meta data";
const STEP_LOAD_CLOUDINIT: &str = "Error loading cloud-init configuration";
const STEP_PARSE_CONFIG: &str = "Error parsing the customization Config File";
const STEP_PRE_SCRIPT: &str = "Error executing pre-customization script";
const STEP_NETWORK: &str = "Error preparing Network Configuration";
const STEP_PASSWORD: &str = "Error applying Password Configuration";
const STEP_POST_SCRIPT: &str = "Error executing post-customization script";
const STEP_MARKER: &str = "Error creating marker files";

/// Progress of a run. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkflowPhase {
    NotStarted,
    Started,
    Running,
    Done,
}

impl WorkflowPhase {
    fn advance(&mut self, next: WorkflowPhase) {
        if next > *self {
            debug!("Customization phase {:?} -> {:?}", self, next);
            *self = next;
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct CustomizationOutcome {
    pub bundle: MetadataBundle,
    /// Raw cloud-init data was used instead of the customization spec
    pub raw_data: bool,
    pub phase: WorkflowPhase,
}

/// Runs one customization. Holds no state between runs.
pub struct CustomizationWorkflow<'a> {
    paths: &'a OvfPaths,
    settings: &'a OvfSettings,
    reporter: &'a dyn StatusReporter,
    tools: &'a dyn ToolsConfig,
    accounts: &'a dyn AccountManager,
    system_devices: SystemDevices,
    nic_enable_wait: Duration,
}

impl<'a> CustomizationWorkflow<'a> {
    pub fn new(
        paths: &'a OvfPaths,
        settings: &'a OvfSettings,
        reporter: &'a dyn StatusReporter,
        tools: &'a dyn ToolsConfig,
        accounts: &'a dyn AccountManager,
        system_devices: SystemDevices,
    ) -> Self {
        Self {
            paths,
            settings,
            reporter,
            tools,
            accounts,
            system_devices,
            nic_enable_wait: Duration::from_secs(1),
        }
    }

    /// Interval between NIC connection polls
    pub fn with_nic_enable_wait(mut self, wait: Duration) -> Self {
        self.nic_enable_wait = wait;
        self
    }

    /// Apply a parsed customization package
    pub async fn run(
        &self,
        conf: &CustomizationConfig,
        files: &ImcFileSet,
    ) -> Result<CustomizationOutcome, DatasourceError> {
        let mut phase = WorkflowPhase::NotStarted;
        self.gc_status(Some(conf), "Started").await;
        phase.advance(WorkflowPhase::Started);

        match &files.metadata {
            Some(md_path) => {
                self.run_raw_data(conf, md_path, files.userdata.as_deref(), phase)
                    .await
            }
            None => self.run_legacy(conf, files.nics.as_deref(), phase).await,
        }
    }

    /// Report a failed step and turn `err` into the fatal error of the run
    pub async fn fail(
        &self,
        conf: Option<&CustomizationConfig>,
        step: &str,
        code: StatusCode,
        err: DatasourceError,
    ) -> DatasourceError {
        warn!("{}: {}", step, err);
        self.reporter
            .set_customization_status(GuestCustState::Running, code, None)
            .await;
        self.gc_status(conf, step).await;
        self.remove_imc_dir().await;
        DatasourceError::customization(step, code, err)
    }

    /// [`Self::fail`] for a missing metadata or userdata file
    pub async fn fail_missing_files(
        &self,
        conf: &CustomizationConfig,
        err: DatasourceError,
    ) -> DatasourceError {
        self.fail(
            Some(conf),
            STEP_MISSING_FILES,
            GuestCustEvent::CustomizeFailed.into(),
            err,
        )
        .await
    }

    /// [`Self::fail`] for a `cust.cfg` that could not be parsed
    pub async fn fail_config_parse(&self, err: DatasourceError) -> DatasourceError {
        self.fail(None, STEP_PARSE_CONFIG, GuestCustEvent::CustomizeFailed.into(), err)
            .await
    }

    async fn run_raw_data(
        &self,
        conf: &CustomizationConfig,
        md_path: &Path,
        ud_path: Option<&Path>,
        mut phase: WorkflowPhase,
    ) -> Result<CustomizationOutcome, DatasourceError> {
        debug!("Start to load cloud-init meta data and user data");
        phase.advance(WorkflowPhase::Running);

        let metadata = match load_metadata(md_path).await {
            Ok(md) => md,
            Err(e @ DatasourceError::Yaml(_)) | Err(e @ DatasourceError::ParseFailure(_)) => {
                return Err(self
                    .fail(
                        Some(conf),
                        STEP_PARSE_METADATA,
                        GuestCustError::WrongMetaFormat.into(),
                        e,
                    )
                    .await);
            }
            Err(e) => {
                return Err(self
                    .fail(
                        Some(conf),
                        STEP_LOAD_CLOUDINIT,
                        GuestCustEvent::CustomizeFailed.into(),
                        e,
                    )
                    .await);
            }
        };

        let userdata = match ud_path {
            Some(path) => match fs::read(path).await {
                Ok(data) => Some(data.into_iter().filter(|b| *b != b'\r').collect()),
                Err(e) => {
                    return Err(self
                        .fail(
                            Some(conf),
                            STEP_LOAD_CLOUDINIT,
                            GuestCustEvent::CustomizeFailed.into(),
                            e.into(),
                        )
                        .await);
                }
            },
            None => None,
        };

        let network_config = match metadata.get("network") {
            Some(network) if !network.is_null() => Some(NetworkConfig::Document(network.clone())),
            _ => fallback_config(&self.system_devices),
        };

        self.remove_imc_dir().await;
        self.report_done(conf).await;
        phase.advance(WorkflowPhase::Done);

        Ok(CustomizationOutcome {
            bundle: MetadataBundle {
                metadata,
                userdata,
                vendordata: None,
                config: Metadata::new(),
                network_config,
            },
            raw_data: true,
            phase,
        })
    }

    async fn run_legacy(
        &self,
        conf: &CustomizationConfig,
        nics_path: Option<&Path>,
        mut phase: WorkflowPhase,
    ) -> Result<CustomizationOutcome, DatasourceError> {
        phase.advance(WorkflowPhase::Running);
        let (metadata, config) = read_vmware_imc(conf);

        let marker_store = MarkerStore::new(self.paths.marker_dir());
        let marker_id = conf.marker_id.as_deref();
        let special = marker_id.is_some_and(|id| !marker_store.exists(id));
        let script = self.custom_script(conf);

        let nics = match self.prepare(conf, nics_path, special, script.is_some()).await {
            Ok(nics) => nics,
            Err(e) => {
                return Err(self
                    .fail(
                        Some(conf),
                        STEP_PARSE_CONFIG,
                        GuestCustEvent::CustomizeFailed.into(),
                        e,
                    )
                    .await);
            }
        };

        if special {
            if let Some(script) = &script {
                if let Err(e) = script.run_pre_customization().await {
                    return Err(self
                        .fail(
                            Some(conf),
                            STEP_PRE_SCRIPT,
                            GuestCustEvent::CustomizeFailed.into(),
                            e,
                        )
                        .await);
                }
            }
        }

        debug!("Preparing the Network configuration");
        let network_config = match self.network_config(conf).await {
            Ok(network) => network,
            Err(e) => {
                return Err(self
                    .fail(
                        Some(conf),
                        STEP_NETWORK,
                        GuestCustEvent::NetworkSetupFailed.into(),
                        e,
                    )
                    .await);
            }
        };

        if special {
            debug!("Applying password customization");
            if conf.admin_password.is_some() || conf.reset_password {
                let configurator = PasswordConfigurator::new(self.accounts, self.paths);
                if let Err(e) = configurator
                    .configure(conf.admin_password.as_deref(), conf.reset_password)
                    .await
                {
                    return Err(self
                        .fail(
                            Some(conf),
                            STEP_PASSWORD,
                            GuestCustEvent::CustomizeFailed.into(),
                            e,
                        )
                        .await);
                }
            } else {
                debug!("Changing password is not needed");
            }

            if let Some(script) = &script {
                if let Err(e) = script.schedule_post_customization(self.paths).await {
                    return Err(self
                        .fail(
                            Some(conf),
                            STEP_POST_SCRIPT,
                            GuestCustEvent::CustomizeFailed.into(),
                            e,
                        )
                        .await);
                }
            }
        }

        if let Some(id) = marker_id {
            if let Err(e) = marker_store.set(id).await {
                return Err(self
                    .fail(
                        Some(conf),
                        STEP_MARKER,
                        GuestCustEvent::CustomizeFailed.into(),
                        e,
                    )
                    .await);
            }
        }

        self.remove_imc_dir().await;
        status::enable_nics_with_wait(self.reporter, nics.as_deref(), self.nic_enable_wait).await;
        self.report_done(conf).await;
        phase.advance(WorkflowPhase::Done);

        Ok(CustomizationOutcome {
            bundle: MetadataBundle {
                metadata,
                userdata: None,
                vendordata: None,
                config,
                network_config: Some(network_config),
            },
            raw_data: false,
            phase,
        })
    }

    /// Read `nics.txt` and check the custom script policy
    async fn prepare(
        &self,
        conf: &CustomizationConfig,
        nics_path: Option<&Path>,
        special: bool,
        has_script: bool,
    ) -> Result<Option<String>, DatasourceError> {
        let nics = nics_to_enable(nics_path).await?;

        if special && has_script {
            let default = if conf.default_run_post_script {
                debug!("Set default value to true due to customization configuration.");
                "true"
            } else {
                "false"
            };
            let enabled = self
                .tools
                .get(TOOLS_CUST_SECTION, TOOLS_ENABLE_CUST_SCRIPTS, default)
                .await;
            if !enabled.eq_ignore_ascii_case("true") {
                debug!("{}", DatasourceError::ScriptDisabled);
                self.reporter
                    .set_customization_status(
                        GuestCustState::Running,
                        GuestCustError::ScriptDisabled.into(),
                        None,
                    )
                    .await;
                return Err(DatasourceError::ScriptDisabled);
            }
        }

        Ok(nics)
    }

    fn custom_script(&self, conf: &CustomizationConfig) -> Option<CustomScript> {
        let name = conf.custom_script_name.as_deref()?;
        if !self.settings.allow_custom_scripts {
            info!("Custom scripts are disabled, ignoring {}", name);
            return None;
        }
        Some(CustomScript::new(&self.paths.imc_dir(), name))
    }

    async fn network_config(
        &self,
        conf: &CustomizationConfig,
    ) -> Result<NetworkConfig, DatasourceError> {
        let configurator = NicConfigurator::new(conf.nics.clone(), Some(self.system_devices.clone()))?;
        nic::configure(self.settings.os_family.as_deref(), self.paths).await?;
        let doc = configurator.network_config(&conf.name_servers, &conf.dns_suffixes)?;
        Ok(NetworkConfig::Generated(doc))
    }

    async fn report_done(&self, conf: &CustomizationConfig) {
        self.reporter
            .set_customization_status(
                GuestCustState::Done,
                GuestCustError::Success.into(),
                None,
            )
            .await;
        self.gc_status(Some(conf), "Successful").await;
    }

    /// Post a gc status when the config asks for it
    async fn gc_status(&self, conf: Option<&CustomizationConfig>, message: &str) {
        if conf.is_some_and(|c| c.post_gc_status) {
            self.reporter.set_gc_status(message).await;
        }
    }

    async fn remove_imc_dir(&self) {
        let dir = self.paths.imc_dir();
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
        }
    }
}

/// Metadata and config of a classic customization
pub fn read_vmware_imc(conf: &CustomizationConfig) -> (Metadata, Metadata) {
    let mut metadata = Metadata::new();
    let mut config = Metadata::new();

    if let Some(fqdn) = conf.fqdn() {
        metadata.insert("local-hostname".to_string(), Value::String(fqdn));
    }
    if let Some(tz) = &conf.timezone {
        config.insert("timezone".to_string(), Value::String(tz.clone()));
    }
    if let Some(locale) = &conf.locale {
        config.insert("locale".to_string(), Value::String(locale.clone()));
    }
    metadata.insert(
        "instance-id".to_string(),
        Value::String(IMC_INSTANCE_ID.to_string()),
    );

    (metadata, config)
}

/// Meta-data file as YAML (or JSON). An empty file is an empty map.
pub async fn load_metadata(path: &Path) -> Result<Metadata, DatasourceError> {
    debug!("load meta data from: {}", path.display());
    let content = fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(Metadata::new());
    }

    match serde_yaml::from_str::<Value>(&content)? {
        Value::Null => Ok(Metadata::new()),
        value @ Value::Mapping(_) => Ok(serde_yaml::from_value(value)?),
        _ => Err(DatasourceError::ParseFailure(format!(
            "meta data in {} is not a mapping",
            path.display()
        ))),
    }
}
