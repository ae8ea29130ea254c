//! FUSE device handles and lazy unmount.

use crate::constants::{DEV_FUSE, FUSE_UNMOUNT_TIMEOUT};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// A FUSE mount requested for the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuseMount {
    pub mount_point: PathBuf,
    /// The FUSE program runs inside the container rather than on the host.
    #[serde(default)]
    pub from_container: bool,
    /// Descriptor number assigned during preparation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
}

/// `/dev/fuse` handles opened for the configured mounts.
#[derive(Debug, Default)]
pub struct FuseHandles {
    pub files: Vec<File>,
    /// Descriptors must be passed to the master over the socket pair.
    pub send_fd: bool,
}

/// Opens the FUSE device once per mount point.
///
/// Requires `enable-fusemount`. The descriptor numbers are recorded on each
/// mount.
pub fn open_fuse_devices(
    mounts: &mut [FuseMount],
    enable_fusemount: bool,
    is_suid: bool,
    fakeroot: bool,
) -> Result<FuseHandles> {
    open_fuse_devices_at(Path::new(DEV_FUSE), mounts, enable_fusemount, is_suid, fakeroot)
}

/// [`open_fuse_devices`] against an explicit device path.
pub fn open_fuse_devices_at(
    device: &Path,
    mounts: &mut [FuseMount],
    enable_fusemount: bool,
    is_suid: bool,
    fakeroot: bool,
) -> Result<FuseHandles> {
    let mut handles = FuseHandles::default();
    if mounts.is_empty() {
        return Ok(handles);
    }
    if !enable_fusemount {
        return Err(Error::ConfigurationDisabled {
            feature: "fusemount".to_string(),
            directive: "enable-fusemount: no".to_string(),
        });
    }

    for mount in mounts.iter_mut() {
        debug!("Opening {} for FUSE mount point {}", device.display(), mount.mount_point.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| Error::path_io(device, e))?;
        mount.fd = Some(file.as_raw_fd());
        if (!is_suid || fakeroot) && !mount.from_container {
            handles.send_fd = true;
        }
        handles.files.push(file);
    }
    Ok(handles)
}

// =============================================================================
// Unmount
// =============================================================================

/// Detaches FUSE mounts.
#[async_trait]
pub trait Unmounter: Send + Sync {
    /// Lazily unmounts `mount_point`: succeeds even while busy.
    async fn unmount_lazy(&self, mount_point: &Path) -> Result<()>;
}

/// Runs `fusermount -z -u` with a bounded wait.
#[derive(Debug, Clone)]
pub struct Fusermount {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl Default for Fusermount {
    fn default() -> Self {
        Self {
            program: PathBuf::from("fusermount"),
            timeout: FUSE_UNMOUNT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Unmounter for Fusermount {
    async fn unmount_lazy(&self, mount_point: &Path) -> Result<()> {
        debug!("Lazy unmounting {} with {}", mount_point.display(), self.program.display());
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg("-z").arg("-u").arg(mount_point).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => Err(Error::Internal(format!(
                "{} -z -u {} exited with {}: {}",
                self.program.display(),
                mount_point.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
            Ok(Err(e)) => Err(Error::path_io(&self.program, e)),
            Err(_) => Err(Error::Timeout {
                operation: format!("lazy unmount of {}", mount_point.display()),
                duration: self.timeout,
            }),
        }
    }
}
