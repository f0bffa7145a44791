//! Guest-RPC through `vmware-rpctool`

use crate::DatasourceError;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Guest-RPC command line tool shipped with VMware Tools / open-vm-tools
pub const RPC_TOOL: &str = "vmware-rpctool";

/// Result of one RPC invocation
#[derive(Debug, Clone)]
pub struct RpcOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RpcOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Whether `tool` resolves to an executable, by name on `PATH` or by path
pub fn tool_available(tool: &Path) -> bool {
    which::which(tool).is_ok()
}

/// Send a single RPC request (e.g. `info-get guestinfo.ovfEnv`)
pub async fn send_rpc(request: &str) -> Result<RpcOutput, DatasourceError> {
    send_rpc_with(Path::new(RPC_TOOL), request).await
}

/// [`send_rpc`] through a specific tool binary
pub async fn send_rpc_with(tool: &Path, request: &str) -> Result<RpcOutput, DatasourceError> {
    if !tool_available(tool) {
        return Err(DatasourceError::TransportUnavailable(format!(
            "{} not installed",
            tool.display()
        )));
    }

    debug!("Sending RPC command: {}", request);
    let output = Command::new(tool)
        .arg(request)
        .output()
        .await
        .map_err(|e| DatasourceError::Command(format!("{}: {}", tool.display(), e)))?;

    Ok(RpcOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
