//! Shared fixtures and test doubles for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cloud_init_ovf::config::OvfSettings;
use cloud_init_ovf::datasources::ovf::{OvfDatasource, OvfFlavor, VmwareServices};
use cloud_init_ovf::datasources::transport::OvfTransport;
use cloud_init_ovf::imc::password::AccountManager;
use cloud_init_ovf::imc::status::{GuestCustState, StatusCode, StatusReporter};
use cloud_init_ovf::imc::tools::ToolsConfig;
use cloud_init_ovf::platform::FixedPlatform;
use cloud_init_ovf::state::OvfPaths;
use cloud_init_ovf::DatasourceError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Everything sent to the platform
#[derive(Debug, Clone, Default)]
pub struct Reports {
    /// (state, code) pairs
    pub states: Vec<(u32, u32)>,
    pub gc: Vec<String>,
}

#[derive(Clone, Default)]
pub struct RecordingReporter(pub Arc<Mutex<Reports>>);

impl RecordingReporter {
    pub fn reports(&self) -> Reports {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn set_customization_status(
        &self,
        state: GuestCustState,
        code: StatusCode,
        _message: Option<&str>,
    ) -> Option<String> {
        self.0.lock().unwrap().states.push((state as u32, code.code()));
        None
    }

    async fn set_gc_status(&self, message: &str) {
        self.0.lock().unwrap().gc.push(message.to_string());
    }
}

/// Answers every tools lookup with the same value, or the default
pub struct StaticTools(pub Option<String>);

#[async_trait]
impl ToolsConfig for StaticTools {
    async fn get(&self, _section: &str, _key: &str, default: &str) -> String {
        self.0.clone().unwrap_or_else(|| default.to_string())
    }
}

#[derive(Clone, Default)]
pub struct RecordingAccounts(pub Arc<Mutex<Vec<String>>>);

#[async_trait]
impl AccountManager for RecordingAccounts {
    async fn set_password(&self, user: &str, _password: &str) -> Result<(), DatasourceError> {
        self.0.lock().unwrap().push(format!("set {}", user));
        Ok(())
    }

    async fn expire_password(&self, user: &str) -> Result<(), DatasourceError> {
        self.0.lock().unwrap().push(format!("expire {}", user));
        Ok(())
    }
}

/// Transport with canned content
pub struct StaticTransport {
    pub name: &'static str,
    pub contents: Option<String>,
}

#[async_trait]
impl OvfTransport for StaticTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self) -> Result<Option<String>, DatasourceError> {
        Ok(self.contents.clone())
    }
}

/// Transport whose fetch always fails with the error built by `error`
pub struct FailingTransport {
    pub name: &'static str,
    pub error: fn() -> DatasourceError,
}

#[async_trait]
impl OvfTransport for FailingTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self) -> Result<Option<String>, DatasourceError> {
        Err((self.error)())
    }
}

pub fn no_transports() -> Vec<Box<dyn OvfTransport>> {
    vec![
        Box::new(StaticTransport {
            name: "com.vmware.guestInfo",
            contents: None,
        }),
        Box::new(StaticTransport {
            name: "iso",
            contents: None,
        }),
    ]
}

pub fn guestinfo(contents: String) -> Vec<Box<dyn OvfTransport>> {
    vec![Box::new(StaticTransport {
        name: "com.vmware.guestInfo",
        contents: Some(contents),
    })]
}

/// OVF environment with the given properties
pub fn env_xml(props: &[(&str, &str)]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1"
     xmlns:oe="http://schemas.dmtf.org/ovf/environment/1"
     oe:id="">
  <PropertySection>
"#,
    );
    for (k, v) in props {
        xml.push_str(&format!("    <Property oe:key=\"{}\" oe:value=\"{}\"/>\n", k, v));
    }
    xml.push_str("  </PropertySection>\n</Environment>\n");
    xml
}

/// Settings with both VMware paths enabled and no waiting
pub fn vmware_settings() -> OvfSettings {
    OvfSettings {
        allow_vmware_cust: true,
        allow_raw_data: true,
        max_wait: Duration::ZERO,
        allow_custom_scripts: true,
        os_family: None,
    }
}

/// A fake root filesystem
pub struct Guest {
    pub tmp: TempDir,
    pub paths: OvfPaths,
    pub reporter: RecordingReporter,
    pub accounts: RecordingAccounts,
}

impl Guest {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let paths = OvfPaths::with_root(tmp.path());
        Self {
            tmp,
            paths,
            reporter: RecordingReporter::default(),
            accounts: RecordingAccounts::default(),
        }
    }

    pub fn write_seed(&self, subdir: &str, xml: &str) -> PathBuf {
        let dir = self.paths.seed_dir().join(subdir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ovf-env.xml");
        fs::write(&path, xml).unwrap();
        path
    }

    pub fn install_plugin(&self) {
        let dir = self.paths.rooted("/usr/lib/open-vm-tools/plugins/vmsvc");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("libdeployPkgPlugin.so"), "").unwrap();
    }

    pub fn add_nic(&self, name: &str, mac: &str) {
        let dir = self.paths.sys_class_net().join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("address"), format!("{}\n", mac)).unwrap();
    }

    /// Write a file into the IMC directory
    pub fn write_imc(&self, name: &str, contents: &str) -> PathBuf {
        let dir = self.paths.imc_dir();
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn marker_files(&self) -> Vec<String> {
        let dir = self.paths.marker_dir();
        if !dir.exists() {
            return Vec::new();
        }
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".markerfile"))
            .collect();
        names.sort();
        names
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn services(&self, tools: Option<&str>) -> VmwareServices {
        VmwareServices {
            reporter: Box::new(self.reporter.clone()),
            tools: Box::new(StaticTools(tools.map(String::from))),
            accounts: Box::new(self.accounts.clone()),
            poll_interval: Some(Duration::from_millis(10)),
            nic_enable_wait: Duration::ZERO,
        }
    }

    /// OVF datasource on a VMware platform
    pub fn vmware_datasource(&self, settings: OvfSettings, tools: Option<&str>) -> OvfDatasource {
        OvfDatasource::new(OvfFlavor::Ovf, self.paths.clone(), settings)
            .with_platform(FixedPlatform::new("VMware Virtual Platform"))
            .with_transports(no_transports())
            .with_vmware_services(self.services(tools))
    }
}
