//! VMware Tools configuration lookup

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

const TOOLBOX_CMD: &str = "vmware-toolbox-cmd";

/// `vmware-toolbox-cmd` exit code for "unavailable"
const EX_UNAVAILABLE: i32 = 69;

/// Read access to the VMware Tools configuration (`tools.conf`)
#[async_trait]
pub trait ToolsConfig: Send + Sync {
    /// Value of `key` in `section`, or `default` when it is not set
    async fn get(&self, section: &str, key: &str, default: &str) -> String;
}

/// Queries `vmware-toolbox-cmd config get`
#[derive(Debug, Default, Clone)]
pub struct ToolboxCmd;

#[async_trait]
impl ToolsConfig for ToolboxCmd {
    async fn get(&self, section: &str, key: &str, default: &str) -> String {
        if which::which(TOOLBOX_CMD).is_err() {
            debug!("{} not installed, returning default value", TOOLBOX_CMD);
            return default.to_string();
        }

        let output = match Command::new(TOOLBOX_CMD)
            .args(["config", "get", section, key])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!("Failed running {} config get {} {}: {}", TOOLBOX_CMD, section, key, e);
                return default.to_string();
            }
        };

        match output.status.code() {
            Some(0) => {}
            Some(EX_UNAVAILABLE) => {
                debug!(
                    "{} returned 69 (unavailable) for [{}] {}, returning default value: {}",
                    TOOLBOX_CMD, section, key, default
                );
                return default.to_string();
            }
            code => {
                error!(
                    "Failed running {} config get {} {}[{:?}]",
                    TOOLBOX_CMD, section, key, code
                );
                return default.to_string();
            }
        }

        match parse_tools_value(&String::from_utf8_lossy(&output.stdout)) {
            Some(value) => {
                debug!("Get tools config: [{}] {} = {}", section, key, value);
                value
            }
            None => {
                debug!(
                    "Tools config: [{}] {} is not found, return default value: {}",
                    section, key, default
                );
                default.to_string()
            }
        }
    }
}

/// Extract the value from `key = value` output
pub fn parse_tools_value(output: &str) -> Option<String> {
    let (key, value) = output.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some(value.trim().to_string())
}
