//! VMware guest customization (IMC)
//!
//! When a VM is powered on with a customization specification, VMware Tools
//! drops a `cust.cfg` (and optionally cloud-init meta-data/user-data or a
//! `nics.txt`) into the IMC directory. This module reads that package and
//! applies it.

pub mod config;
pub mod config_file;
pub mod nic;
pub mod password;
pub mod rpc;
pub mod script;
pub mod status;
pub mod tools;
pub mod workflow;

pub use config::{CustomizationConfig, NicDescriptor};
pub use config_file::ConfigFile;
pub use nic::NicConfigurator;
pub use status::{RpcStatusReporter, StatusReporter};
pub use workflow::{CustomizationOutcome, CustomizationWorkflow};

use crate::DatasourceError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;
use walkdir::WalkDir;

/// Name of the customization config in the IMC directory
pub const CUST_CFG_FILE: &str = "cust.cfg";

/// NICs to connect once customization is done
pub const NICS_FILE: &str = "nics.txt";

/// Only this much of `nics.txt` is read
const NICS_SIZE: u64 = 1024;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Files accompanying `cust.cfg`. `metadata` and `nics` never both occur.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImcFileSet {
    pub metadata: Option<PathBuf>,
    pub userdata: Option<PathBuf>,
    pub nics: Option<PathBuf>,
}

/// Locate the files the customization config refers to.
///
/// A declared meta-data file must exist, as must a declared user-data file.
/// Without meta-data, `nics.txt` is picked up when present.
pub async fn collect_imc_file_paths(
    conf: &CustomizationConfig,
    imc_dir: &Path,
) -> Result<ImcFileSet, DatasourceError> {
    let mut files = ImcFileSet::default();

    let Some(md_name) = conf.meta_data_name.as_deref() else {
        let nics = imc_dir.join(NICS_FILE);
        if fs::try_exists(&nics).await? {
            files.nics = Some(nics);
        } else {
            debug!("{} does not exist.", nics.display());
        }
        return Ok(files);
    };

    let md_path = imc_dir.join(md_name);
    if !fs::try_exists(&md_path).await? {
        return Err(DatasourceError::MissingFile(format!(
            "meta data file is not found: {}",
            md_path.display()
        )));
    }
    files.metadata = Some(md_path);

    if let Some(ud_name) = conf.user_data_name.as_deref() {
        let ud_path = imc_dir.join(ud_name);
        if !fs::try_exists(&ud_path).await? {
            return Err(DatasourceError::MissingFile(format!(
                "user data file is not found: {}",
                ud_path.display()
            )));
        }
        files.userdata = Some(ud_path);
    }

    Ok(files)
}

/// First kilobyte of `nics.txt`
pub async fn nics_to_enable(path: Option<&Path>) -> Result<Option<String>, DatasourceError> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !fs::try_exists(path).await? {
        return Ok(None);
    }

    let mut buf = Vec::new();
    fs::File::open(path)
        .await?
        .take(NICS_SIZE)
        .read_to_end(&mut buf)
        .await?;
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Recursively look for `filename` below `dir`
pub fn search_file(dir: &Path, filename: &str) -> Option<PathBuf> {
    if filename.is_empty() {
        return None;
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == filename)
        .map(|entry| entry.into_path())
}

/// Poll interval for a given budget: one second for short waits
pub fn poll_interval_for(max_wait: Duration) -> Duration {
    if max_wait <= POLL_INTERVAL {
        Duration::from_secs(1)
    } else {
        POLL_INTERVAL
    }
}

/// Wait up to `max_wait` for `filename` to appear in `dir`.
///
/// The file is checked before every sleep and once more after the budget is
/// spent, so a zero budget still checks once.
pub async fn wait_for_imc_cfg_file(
    dir: &Path,
    filename: &str,
    max_wait: Duration,
    poll: Duration,
) -> Option<PathBuf> {
    let path = dir.join(filename);
    let start = tokio::time::Instant::now();
    let mut waited = Duration::ZERO;

    loop {
        if path.is_file() {
            debug!("waiting for configuration file took {:.3} seconds", start.elapsed().as_secs_f64());
            return Some(path);
        }
        if waited >= max_wait {
            break;
        }
        debug!("Waiting for VMware Customization Config File");
        let nap = poll.min(max_wait - waited);
        tokio::time::sleep(nap).await;
        waited += nap;
    }

    debug!(
        "Did not find VMware Customization Config File after {:.3} seconds",
        start.elapsed().as_secs_f64()
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_collect_metadata_and_userdata() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("test-meta"), "instance-id: x\n").unwrap();
        std::fs::write(tmp.path().join("test-user"), "#cloud-config\n").unwrap();
        std::fs::write(tmp.path().join(NICS_FILE), "NIC1").unwrap();

        let conf = CustomizationConfig {
            meta_data_name: Some("test-meta".into()),
            user_data_name: Some("test-user".into()),
            ..Default::default()
        };
        let files = collect_imc_file_paths(&conf, tmp.path()).await.unwrap();
        assert_eq!(files.metadata, Some(tmp.path().join("test-meta")));
        assert_eq!(files.userdata, Some(tmp.path().join("test-user")));
        assert!(files.nics.is_none());
    }

    #[tokio::test]
    async fn test_collect_missing_metadata() {
        let tmp = TempDir::new().unwrap();
        let conf = CustomizationConfig {
            meta_data_name: Some("test-meta".into()),
            ..Default::default()
        };
        assert!(matches!(
            collect_imc_file_paths(&conf, tmp.path()).await,
            Err(DatasourceError::MissingFile(_))
        ));
    }

    #[tokio::test]
    async fn test_collect_missing_userdata() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("test-meta"), "{}").unwrap();
        let conf = CustomizationConfig {
            meta_data_name: Some("test-meta".into()),
            user_data_name: Some("test-user".into()),
            ..Default::default()
        };
        assert!(matches!(
            collect_imc_file_paths(&conf, tmp.path()).await,
            Err(DatasourceError::MissingFile(_))
        ));
    }

    #[tokio::test]
    async fn test_collect_nics() {
        let tmp = TempDir::new().unwrap();
        let conf = CustomizationConfig::default();
        assert_eq!(
            collect_imc_file_paths(&conf, tmp.path()).await.unwrap(),
            ImcFileSet::default()
        );

        std::fs::write(tmp.path().join(NICS_FILE), "NIC1,NIC2").unwrap();
        let files = collect_imc_file_paths(&conf, tmp.path()).await.unwrap();
        assert_eq!(files.nics, Some(tmp.path().join(NICS_FILE)));
    }

    #[tokio::test]
    async fn test_nics_to_enable_is_truncated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(NICS_FILE);
        std::fs::write(&path, "N".repeat(4096)).unwrap();
        let nics = nics_to_enable(Some(&path)).await.unwrap().unwrap();
        assert_eq!(nics.len(), 1024);
        assert_eq!(nics_to_enable(None).await.unwrap(), None);
    }

    #[test]
    fn test_search_file_recurses() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("plugins/vmsvc");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("libdeployPkgPlugin.so"), "").unwrap();

        assert_eq!(
            search_file(tmp.path(), "libdeployPkgPlugin.so"),
            Some(nested.join("libdeployPkgPlugin.so"))
        );
        assert_eq!(search_file(tmp.path(), "other.so"), None);
        assert_eq!(search_file(&tmp.path().join("missing"), "libdeployPkgPlugin.so"), None);
    }

    #[test]
    fn test_poll_interval() {
        assert_eq!(poll_interval_for(Duration::from_secs(3)), Duration::from_secs(1));
        assert_eq!(poll_interval_for(Duration::from_secs(15)), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gives_up_within_budget() {
        let tmp = TempDir::new().unwrap();
        let start = tokio::time::Instant::now();
        let found = wait_for_imc_cfg_file(
            tmp.path(),
            CUST_CFG_FILE,
            Duration::from_secs(12),
            Duration::from_secs(5),
        )
        .await;
        assert!(found.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(12));
        assert!(elapsed <= Duration::from_secs(17));
    }

    #[tokio::test]
    async fn test_wait_finds_existing_file_without_budget() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CUST_CFG_FILE), "[NETWORK]\n").unwrap();
        let found =
            wait_for_imc_cfg_file(tmp.path(), CUST_CFG_FILE, Duration::ZERO, Duration::from_secs(1))
                .await;
        assert_eq!(found, Some(tmp.path().join(CUST_CFG_FILE)));
    }
}
