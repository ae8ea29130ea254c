//! Host state detection.
//!
//! Everything the pipeline needs to know about the machine and the calling
//! process is sampled once, at the start of preparation, into a [`HostState`].
//! Nothing here is cached across launches.

use crate::constants::{MOUNTINFO_PATH, PROC_FILESYSTEMS, ROOTLESS_OVERLAY_KERNEL, SUID_INSTALL};
use crate::error::Result;
use crate::identity::Identity;
use std::collections::HashSet;
use std::path::PathBuf;

/// Kernel and namespace features that affect the execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFeatures {
    /// Kernel release (e.g. `6.1.0-13-amd64`).
    pub kernel_version: Option<String>,
    /// Filesystems listed in `/proc/filesystems`.
    pub filesystems: HashSet<String>,
    /// The calling process already runs inside a user namespace.
    pub in_user_namespace: bool,
    /// The kernel can mount overlay inside a user namespace.
    pub rootless_overlay: bool,
}

impl HostFeatures {
    /// Detects kernel features of the running host.
    pub fn detect() -> Self {
        let kernel_version = Self::detect_kernel_version();
        let filesystems = Self::detect_filesystems();
        let in_user_namespace = Self::detect_user_namespace();
        let rootless_overlay = kernel_version
            .as_deref()
            .and_then(parse_kernel_release)
            .is_some_and(|v| v >= ROOTLESS_OVERLAY_KERNEL);

        Self {
            kernel_version,
            filesystems,
            in_user_namespace,
            rootless_overlay,
        }
    }

    /// Returns true if the kernel lists overlay support.
    pub fn has_overlay(&self) -> bool {
        self.filesystems.contains("overlay")
    }

    fn detect_kernel_version() -> Option<String> {
        nix::sys::utsname::uname()
            .ok()
            .map(|u| u.release().to_string_lossy().into_owned())
    }

    fn detect_filesystems() -> HashSet<String> {
        std::fs::read_to_string(PROC_FILESYSTEMS)
            .map(|content| parse_filesystems(&content))
            .unwrap_or_default()
    }

    /// A process outside any user namespace sees the identity map
    /// `0 0 4294967295`.
    fn detect_user_namespace() -> bool {
        match std::fs::read_to_string("/proc/self/uid_map") {
            Ok(content) => !is_identity_map(&content),
            Err(_) => false,
        }
    }
}

/// Parses `/proc/filesystems` content into filesystem names.
pub fn parse_filesystems(content: &str) -> HashSet<String> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_string)
        .collect()
}

/// Returns true if a `uid_map` describes the initial user namespace.
pub fn is_identity_map(content: &str) -> bool {
    let fields: Vec<&str> = content.split_whitespace().collect();
    fields == ["0", "0", "4294967295"]
}

/// Extracts `(major, minor)` from a kernel release string.
pub fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

// =============================================================================
// Terminal / Process Group
// =============================================================================

/// Process group state used to decide signal propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroups {
    /// Foreground process group of the controlling terminal, if any.
    pub terminal: Option<i32>,
    /// Process group of this process.
    pub own: i32,
}

impl ProcessGroups {
    /// Samples the controlling terminal of stdin, stdout or stderr.
    pub fn detect() -> Self {
        let mut terminal = None;
        for fd in 0..=2 {
            let mut pgrp: libc::pid_t = 0;
            // SAFETY: TIOCGPGRP writes a single pid_t through the pointer. EBADF
            // and ENOTTY leave pgrp at 0, which we treat as "no terminal".
            let rc = unsafe { libc::ioctl(fd, libc::TIOCGPGRP, &mut pgrp) };
            if rc == 0 && pgrp != 0 {
                terminal = Some(pgrp);
                break;
            }
        }
        Self {
            terminal,
            own: nix::unistd::getpgrp().as_raw(),
        }
    }

    /// Signals must be forwarded to the container when there is no
    /// controlling terminal or when we are not its foreground group.
    pub fn needs_signal_propagation(&self) -> bool {
        match self.terminal {
            None => true,
            Some(pgrp) => pgrp != self.own,
        }
    }
}

// =============================================================================
// Host State Snapshot
// =============================================================================

/// Snapshot of host state sampled once at preparation start.
#[derive(Debug, Clone)]
pub struct HostState {
    /// Set by the native stage: the launcher runs setuid.
    pub is_suid: bool,
    /// Installation ships a setuid starter. Root may still run the
    /// unprivileged one, so this differs from `is_suid`.
    pub suid_install: bool,
    pub identity: Identity,
    pub features: HostFeatures,
    pub process_groups: ProcessGroups,
    /// Mount table consulted for autofs pinning.
    pub mountinfo: PathBuf,
}

impl HostState {
    /// Samples the current host.
    pub fn sample(is_suid: bool) -> Result<Self> {
        Ok(Self {
            is_suid,
            suid_install: SUID_INSTALL,
            identity: Identity::current()?,
            features: HostFeatures::detect(),
            process_groups: ProcessGroups::detect(),
            mountinfo: PathBuf::from(MOUNTINFO_PATH),
        })
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "uid={} suid={} suid_install={} kernel={} userns={} overlay={}",
            self.identity.uid,
            self.is_suid,
            self.suid_install,
            self.features.kernel_version.as_deref().unwrap_or("unknown"),
            self.features.in_user_namespace,
            self.features.has_overlay()
        )
    }
}
