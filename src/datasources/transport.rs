//! OVF environment transports
//!
//! A transport delivers the raw OVF environment document, or nothing. Errors
//! are recoverable: the resolver logs them and tries the next transport.

use crate::device::{self, maybe_cdrom_device};
use crate::imc::rpc;
use crate::ovf::find_ovf_env;
use crate::DatasourceError;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Provenance label of the guest-RPC transport
pub const GUESTINFO_TRANSPORT: &str = "com.vmware.guestInfo";

/// Provenance label of the ISO9660 transport
pub const ISO_TRANSPORT: &str = "iso";

const ISO9660: &str = "iso9660";

/// Something that can hand over an OVF environment document
#[async_trait]
pub trait OvfTransport: Send + Sync {
    /// Label recorded in the datasource source list
    fn name(&self) -> &'static str;

    /// The document, `None` when this transport has nothing
    async fn fetch(&self) -> Result<Option<String>, DatasourceError>;
}

/// `guestinfo.ovfEnv` through `vmware-rpctool`
#[derive(Debug, Clone)]
pub struct GuestInfoTransport {
    tool: PathBuf,
}

impl Default for GuestInfoTransport {
    fn default() -> Self {
        Self {
            tool: PathBuf::from(rpc::RPC_TOOL),
        }
    }
}

impl GuestInfoTransport {
    /// Use another RPC tool binary
    pub fn with_tool(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }
}

#[async_trait]
impl OvfTransport for GuestInfoTransport {
    fn name(&self) -> &'static str {
        GUESTINFO_TRANSPORT
    }

    async fn fetch(&self) -> Result<Option<String>, DatasourceError> {
        if !rpc::tool_available(&self.tool) {
            debug!("{} not found", self.tool.display());
            return Ok(None);
        }

        let out = rpc::send_rpc_with(&self.tool, "info-get guestinfo.ovfEnv").await?;
        match out.code {
            Some(0) if !out.stdout.is_empty() => Ok(Some(out.stdout)),
            Some(0) => {
                debug!("{} exited 0 with empty stdout", self.tool.display());
                Ok(None)
            }
            // 1 means the key is not set
            Some(1) => Ok(None),
            code => {
                warn!("{} exited with code {:?}", self.tool.display(), code);
                debug!("{}", out.stderr.trim());
                Ok(None)
            }
        }
    }
}

/// An optical drive carrying `ovf-env.xml` on an iso9660 filesystem
#[derive(Debug, Default, Clone)]
pub struct Iso9660Transport;

#[async_trait]
impl OvfTransport for Iso9660Transport {
    fn name(&self) -> &'static str {
        ISO_TRANSPORT
    }

    async fn fetch(&self) -> Result<Option<String>, DatasourceError> {
        // Already-mounted media first
        for entry in device::mounts().await? {
            if entry.fstype != ISO9660 || !maybe_cdrom_device(&entry.device) {
                continue;
            }
            if let Some((_, contents)) = find_ovf_env(&entry.mountpoint).await {
                return Ok(Some(contents));
            }
        }

        let devices = device::find_devs_with(Some(ISO9660)).await?;

        for dev in devices.iter().filter(|d| maybe_cdrom_device(d)) {
            let found = device::mount_cb(dev, Some(ISO9660), |mountpoint| async move {
                find_ovf_env(&mountpoint).await
            })
            .await;

            match found {
                Ok(Some((_, contents))) => return Ok(Some(contents)),
                Ok(None) => {}
                Err(e) => debug!("{} not mountable as iso9660: {}", dev, e),
            }
        }

        Ok(None)
    }
}
