//! Admin password handling for VMware customization

use crate::DatasourceError;
use crate::state::OvfPaths;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::process::Stdio;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Operations on local accounts
#[async_trait]
pub trait AccountManager: Send + Sync {
    /// Set a plain-text password
    async fn set_password(&self, user: &str, password: &str) -> Result<(), DatasourceError>;

    /// Force a password change at next login
    async fn expire_password(&self, user: &str) -> Result<(), DatasourceError>;
}

/// Uses `chpasswd`, `passwd` and `chage`
#[derive(Debug, Default, Clone)]
pub struct SystemAccounts;

#[async_trait]
impl AccountManager for SystemAccounts {
    async fn set_password(&self, user: &str, password: &str) -> Result<(), DatasourceError> {
        debug!("Setting password for user {}", user);

        let input = format!("{}:{}", user, password);
        let mut child = Command::new("chpasswd")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DatasourceError::Command(e.to_string()))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| DatasourceError::Command(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DatasourceError::Command(e.to_string()))?;

        if !output.status.success() {
            return Err(DatasourceError::Command(format!(
                "Failed to set password for {}: {}",
                user,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn expire_password(&self, user: &str) -> Result<(), DatasourceError> {
        let output = Command::new("passwd")
            .args(["--expire", user])
            .output()
            .await
            .map_err(|e| DatasourceError::Command(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }

        warn!(
            "Failed to expire password for {} with passwd: {}",
            user,
            String::from_utf8_lossy(&output.stderr).trim()
        );

        let output = Command::new("chage")
            .args(["-d", "0", user])
            .output()
            .await
            .map_err(|e| DatasourceError::Command(e.to_string()))?;
        if !output.status.success() {
            return Err(DatasourceError::Command(format!(
                "Failed to expire password for {}: {}",
                user,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Applies the `[PASSWORD]` section of a customization config
pub struct PasswordConfigurator<'a> {
    accounts: &'a dyn AccountManager,
    paths: &'a OvfPaths,
}

impl<'a> PasswordConfigurator<'a> {
    pub fn new(accounts: &'a dyn AccountManager, paths: &'a OvfPaths) -> Self {
        Self { accounts, paths }
    }

    /// `password` is the base64 value from the config file
    pub async fn configure(
        &self,
        password: Option<&str>,
        reset: bool,
    ) -> Result<(), DatasourceError> {
        info!("Starting password configuration");

        let password = match password {
            Some(encoded) => {
                let decoded = BASE64.decode(encoded.trim()).map_err(|e| {
                    DatasourceError::ParseFailure(format!("admin password is not base64: {}", e))
                })?;
                Some(String::from_utf8(decoded).map_err(|_| {
                    DatasourceError::ParseFailure("admin password is not UTF-8".to_string())
                })?)
            }
            None => None,
        };

        let users = self.uid0_users().await?;

        if let Some(password) = password {
            info!("Setting admin password");
            self.accounts.set_password("root", &password).await?;
        }

        if reset {
            info!("Expiring password for {} account(s)", users.len());
            for user in &users {
                self.accounts.expire_password(user).await?;
            }
        }

        info!("Password configuration completed");
        Ok(())
    }

    /// uid-0 accounts from passwd that also have a shadow entry
    async fn uid0_users(&self) -> Result<Vec<String>, DatasourceError> {
        let passwd = fs::read_to_string(self.paths.passwd_file()).await?;
        let roots: Vec<&str> = passwd
            .lines()
            .filter_map(|line| {
                let mut fields = line.split(':');
                let name = fields.next()?;
                (fields.nth(1)? == "0").then_some(name)
            })
            .collect();

        let shadow = fs::read_to_string(self.paths.shadow_file()).await?;
        Ok(shadow
            .lines()
            .filter_map(|line| line.split(':').next())
            .filter(|user| roots.contains(user))
            .map(String::from)
            .collect())
    }
}
