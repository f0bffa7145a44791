//! Filesystem layout used by the OVF datasource
//!
//! Every location the datasource touches hangs off a root directory so the
//! whole layout can be relocated under a temporary directory in tests.

use std::path::{Path, PathBuf};

/// Base directory for cloud-init state
pub const CLOUD_DIR: &str = "var/lib/cloud";

/// Cloud configuration directory
pub const CONFIG_DIR: &str = "etc/cloud";

/// Directory VMware Tools copies the customization package into
pub const VMWARE_IMC_DIR: &str = "var/run/vmware-imc";

/// Marker left behind when a post-customization script is pending
pub const POST_CUSTOM_PENDING_MARKER: &str = ".guest-customization-post-reboot-pending";

/// Paths used by the datasource
#[derive(Debug, Clone)]
pub struct OvfPaths {
    /// Filesystem root (default: /)
    pub root: PathBuf,
}

impl Default for OvfPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl OvfPaths {
    /// Create with the real filesystem root
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    /// Create with a custom root (useful for testing)
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    // ==================== cloud-init state ====================

    /// /var/lib/cloud
    pub fn cloud_dir(&self) -> PathBuf {
        self.root.join(CLOUD_DIR)
    }

    /// /var/lib/cloud/seed
    pub fn seed_dir(&self) -> PathBuf {
        self.cloud_dir().join("seed")
    }

    /// /var/lib/cloud/data - marker files live here
    pub fn marker_dir(&self) -> PathBuf {
        self.cloud_dir().join("data")
    }

    /// /var/lib/cloud/scripts/per-instance
    pub fn scripts_per_instance(&self) -> PathBuf {
        self.cloud_dir().join("scripts").join("per-instance")
    }

    /// /etc/cloud
    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    /// /etc/cloud/cloud.cfg
    pub fn main_config(&self) -> PathBuf {
        self.config_dir().join("cloud.cfg")
    }

    /// /etc/cloud/cloud.cfg.d
    pub fn config_d(&self) -> PathBuf {
        self.config_dir().join("cloud.cfg.d")
    }

    // ==================== VMware ====================

    /// /var/run/vmware-imc
    pub fn imc_dir(&self) -> PathBuf {
        self.root.join(VMWARE_IMC_DIR)
    }

    /// /.guest-customization-post-reboot-pending
    pub fn post_custom_pending_marker(&self) -> PathBuf {
        self.root.join(POST_CUSTOM_PENDING_MARKER)
    }

    // ==================== System ====================

    /// /sys/class/dmi/id/product_name
    pub fn dmi_product_name(&self) -> PathBuf {
        self.root.join("sys/class/dmi/id/product_name")
    }

    /// /sys/class/net
    pub fn sys_class_net(&self) -> PathBuf {
        self.root.join("sys/class/net")
    }

    /// /etc/network
    pub fn etc_network(&self) -> PathBuf {
        self.root.join("etc/network")
    }

    /// /var/lib/dhcp
    pub fn dhcp_lease_dir(&self) -> PathBuf {
        self.root.join("var/lib/dhcp")
    }

    /// /etc/passwd
    pub fn passwd_file(&self) -> PathBuf {
        self.root.join("etc/passwd")
    }

    /// /etc/shadow
    pub fn shadow_file(&self) -> PathBuf {
        self.root.join("etc/shadow")
    }

    /// Resolve an absolute system path under the root
    pub fn rooted(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }
}
