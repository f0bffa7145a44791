//! Platform identification through DMI

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Source of the DMI `system-product-name`
#[async_trait]
pub trait PlatformInfo: Send + Sync {
    async fn system_product_name(&self) -> Option<String>;

    /// Product name mentions VMware
    async fn is_vmware(&self) -> bool {
        self.system_product_name()
            .await
            .is_some_and(|name| name.to_lowercase().contains("vmware"))
    }
}

/// Reads `/sys/class/dmi/id/product_name`
#[derive(Debug, Clone)]
pub struct DmiPlatform {
    product_name_path: PathBuf,
}

impl DmiPlatform {
    pub fn new(product_name_path: impl Into<PathBuf>) -> Self {
        Self {
            product_name_path: product_name_path.into(),
        }
    }
}

#[async_trait]
impl PlatformInfo for DmiPlatform {
    async fn system_product_name(&self) -> Option<String> {
        match fs::read_to_string(&self.product_name_path).await {
            Ok(name) => Some(name.trim().to_string()),
            Err(_) => {
                debug!("No system-product-name found");
                None
            }
        }
    }
}

/// Fixed product name, for running off-platform
#[derive(Debug, Clone, Default)]
pub struct FixedPlatform(pub Option<String>);

impl FixedPlatform {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Some(name.into()))
    }
}

#[async_trait]
impl PlatformInfo for FixedPlatform {
    async fn system_product_name(&self) -> Option<String> {
        self.0.clone()
    }
}
