//! Custom scripts shipped in the customization package

use crate::DatasourceError;
use crate::state::OvfPaths;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

/// Name of the post-customization script in the per-instance scripts dir
pub const POST_CUSTOMIZE_SCRIPT: &str = "post-customize-guest.sh";

/// A script named by `CUSTOM-SCRIPT|SCRIPT-NAME`, located in the IMC dir
#[derive(Debug, Clone)]
pub struct CustomScript {
    path: PathBuf,
}

impl CustomScript {
    pub fn new(directory: &Path, name: &str) -> Self {
        Self {
            path: directory.join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check presence, strip carriage returns and make executable
    async fn prepare(&self) -> Result<(), DatasourceError> {
        if !fs::try_exists(&self.path).await? {
            return Err(DatasourceError::MissingFile(format!(
                "Script {} not found!!",
                self.path.display()
            )));
        }

        let content = fs::read(&self.path).await?;
        let cleaned: Vec<u8> = content.into_iter().filter(|b| *b != b'\r').collect();
        fs::write(&self.path, cleaned).await?;
        make_executable(&self.path).await
    }

    /// Run as `<script> precustomization`
    pub async fn run_pre_customization(&self) -> Result<(), DatasourceError> {
        self.prepare().await?;
        info!("Executing pre-customization script");

        let output = Command::new(&self.path)
            .arg("precustomization")
            .output()
            .await
            .map_err(|e| DatasourceError::Command(format!("{}: {}", self.path.display(), e)))?;

        debug!("pre-customization stdout: {}", String::from_utf8_lossy(&output.stdout));
        if !output.status.success() {
            return Err(DatasourceError::Command(format!(
                "pre-customization script exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Install as a per-instance script and flag the post-reboot step as
    /// pending. The script itself runs later in boot.
    pub async fn schedule_post_customization(&self, paths: &OvfPaths) -> Result<(), DatasourceError> {
        self.prepare().await?;

        let scripts_dir = paths.scripts_per_instance();
        fs::create_dir_all(&scripts_dir).await?;
        let target = scripts_dir.join(POST_CUSTOMIZE_SCRIPT);
        info!("Copying post customization script to {}", target.display());
        fs::copy(&self.path, &target).await?;
        make_executable(&target).await?;

        let marker = paths.post_custom_pending_marker();
        info!("Creating post customization pending marker {}", marker.display());
        fs::write(&marker, b"").await?;
        Ok(())
    }
}

async fn make_executable(path: &Path) -> Result<(), DatasourceError> {
    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms).await?;
    Ok(())
}
