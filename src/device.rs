//! Block device and mount probing
//!
//! Used by the ISO9660 transport to find optical drives that may carry an
//! OVF environment, both already-mounted and not-yet-mounted ones.

use crate::DatasourceError;
use regex::Regex;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

/// Environment variable overriding the optical device name pattern
pub const CDROM_DEV_REGEX_ENV: &str = "CLOUD_INIT_CDROM_DEV_REGEX";

/// Matches the udev cdrom rule: `KERNEL!="sr[0-9]*|hd[a-z]|xvd*"`
pub const DEFAULT_CDROM_DEV_REGEX: &str = r"^(sr[0-9]+|hd[a-z]|xvd.*)";

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
}

/// Whether `devname` names a device that may hold an ISO9660 filesystem.
///
/// Accepts kernel names (`sr0`) and `/dev/` paths, but nothing below another
/// directory (`/dev/foo/bar/xvdc`, `foo/bar/xvdc`).
pub fn maybe_cdrom_device(devname: &str) -> bool {
    let pattern = std::env::var(CDROM_DEV_REGEX_ENV).unwrap_or_else(|_| DEFAULT_CDROM_DEV_REGEX.to_string());
    match Regex::new(&pattern) {
        Ok(re) => maybe_cdrom_device_with(devname, &re),
        Err(e) => {
            warn!("Invalid {} '{}': {}", CDROM_DEV_REGEX_ENV, pattern, e);
            false
        }
    }
}

/// [`maybe_cdrom_device`] with an explicit pattern. The pattern is anchored at
/// the start of the name.
pub fn maybe_cdrom_device_with(devname: &str, pattern: &Regex) -> bool {
    if devname.is_empty() {
        return false;
    }

    let normalized = normalize_path(devname);
    let mut name = normalized.as_str();

    if let Some(rest) = name.strip_prefix("/dev/") {
        name = rest;
    }

    // A leading slash (/sr0) is tolerated, a nested path is not
    let name = if name.starts_with('/') {
        name.rsplit('/').next().unwrap_or_default()
    } else if name.contains('/') {
        return false;
    } else {
        name
    };

    if name.is_empty() {
        return false;
    }

    pattern.find(name).is_some_and(|m| m.start() == 0)
}

/// Lexically resolve `.`, `..` and repeated separators
fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
            Component::ParentDir => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            _ => {}
        }
    }

    let joined = parts.join("/");
    if absolute { format!("/{}", joined) } else { joined }
}

/// Parse a mount table in `/proc/mounts` format
pub fn parse_mounts(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                mountpoint: PathBuf::from(unescape_mount_field(mountpoint)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Undo the octal escaping the kernel applies to spaces and tabs
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Current mount table
pub async fn mounts() -> Result<Vec<MountEntry>, DatasourceError> {
    let table = fs::read_to_string("/proc/mounts").await?;
    Ok(parse_mounts(&table))
}

/// Devices carrying a filesystem of `fstype` (all devices with `None`)
pub async fn find_devs_with(fstype: Option<&str>) -> Result<Vec<String>, DatasourceError> {
    let mut cmd = Command::new("blkid");
    cmd.args(["-c", "/dev/null"]);
    if let Some(fstype) = fstype {
        cmd.arg(format!("-tTYPE={}", fstype));
    }
    cmd.arg("-odevice");

    let output = cmd
        .output()
        .await
        .map_err(|e| DatasourceError::TransportUnavailable(format!("blkid: {}", e)))?;

    // blkid exits 2 when nothing matched
    match output.status.code() {
        Some(0) => {}
        Some(2) => return Ok(Vec::new()),
        _ => {
            return Err(DatasourceError::Command(format!(
                "blkid failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Mount `device` read-only, run `callback` on the mount point, unmount.
///
/// A device that is already mounted is used in place. The temporary mount is
/// released whatever the callback returns.
pub async fn mount_cb<F, Fut, T>(
    device: &str,
    mtype: Option<&str>,
    callback: F,
) -> Result<T, DatasourceError>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = T>,
{
    if let Ok(table) = mounts().await {
        if let Some(entry) = table.iter().find(|m| m.device == device) {
            debug!("{} already mounted at {}", device, entry.mountpoint.display());
            return Ok(callback(entry.mountpoint.clone()).await);
        }
    }

    let tmp = tempfile::Builder::new().prefix("tmp-ovf-").tempdir()?;
    let mountpoint = tmp.path().to_path_buf();

    let mut cmd = Command::new("mount");
    cmd.args(["-o", "ro"]);
    if let Some(mtype) = mtype {
        cmd.args(["-t", mtype]);
    }
    cmd.arg(device).arg(&mountpoint);

    let output = cmd
        .output()
        .await
        .map_err(|e| DatasourceError::TransportUnavailable(format!("mount: {}", e)))?;
    if !output.status.success() {
        return Err(DatasourceError::TransportUnavailable(format!(
            "failed mounting {}: {}",
            device,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let result = callback(mountpoint.clone()).await;

    match Command::new("umount").arg(&mountpoint).output().await {
        Ok(out) if out.status.success() => {}
        Ok(out) => warn!(
            "Failed to unmount {}: {}",
            mountpoint.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => warn!("Failed to unmount {}: {}", mountpoint.display(), e),
    }

    Ok(result)
}
