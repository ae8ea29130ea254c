//! # Instance Records and Join Integrity
//!
//! An instance record lives under the invoking user's home directory and is
//! therefore **untrusted** whenever the joiner is not root. Before a setuid
//! join trusts the record, the target process has to pass every proof below;
//! they are evaluated in order and all must hold.
//!
//! | Proof | Holds when |
//! |-------|------------|
//! | [`Proof::NoUserNamespace`] | `uid_map` has no host ID above 0 (or user namespaces are unsupported) |
//! | [`Proof::RootLinkDenied`] | reading the `root` link fails with `EACCES` |
//! | [`Proof::TaskOwnership`] | `task` is owned by the joining UID/GID |
//! | [`Proof::ParentPid`] | `status` reports the recorded PPid |
//! | [`Proof::ParentRootLinkDenied`] | `../<ppid>/root` fails with `EACCES` |
//! | [`Proof::ParentTaskOwnership`] | `../<ppid>/task` is owned by the joining UID/GID |
//! | [`Proof::SupervisorComm`] | `comm` is the supervisor name |
//!
//! The `EACCES` fingerprint comes from the supervisor having been started by
//! the setuid starter: its procfs entries stay root-owned after it drops
//! privileges, which an arbitrary user process cannot reproduce.
//!
//! All paths are relative to a directory descriptor on `/proc/<pid>`, so a
//! recycled PID fails the proofs instead of redirecting them.

use crate::constants::{CGROUP_ROOT, INSTANCE_DIR, INSTANCE_SUPERVISOR_COMM};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Instance Record
// =============================================================================

/// Persisted description of a running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub name: String,
    pub pid: i32,
    pub ppid: i32,
    #[serde(default, rename = "userns")]
    pub user_ns: bool,
    #[serde(default)]
    pub cgroup: bool,
    /// Engine configuration the instance was started with.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Location of the record for `name` under `home`.
    pub fn path_for(home: &Path, hostname: &str, name: &str) -> PathBuf {
        home.join(INSTANCE_DIR)
            .join(hostname)
            .join(format!("{}.json", name))
    }

    /// Reads and parses a record.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| Error::path_io(path, e))?;
        let record: Self = serde_json::from_slice(&data)?;
        debug!(
            "loaded instance {} (pid {}, ppid {}, userns {})",
            record.name, record.pid, record.ppid, record.user_ns
        );
        Ok(record)
    }
}

/// Checks the setuid expectation for joining `record` and the plausibility
/// of its process IDs.
///
/// Returns whether the join is enforced (setuid-required) and so needs the
/// integrity proofs. Runs before any `/proc` entry is opened.
pub fn check_join_privilege(uid: u32, is_suid: bool, record: &InstanceRecord) -> Result<bool> {
    let suid_required = uid != 0 && !record.user_ns;

    if is_suid && !suid_required {
        return Err(Error::PrivilegeMismatch(
            "joining user namespace with suid workflow is not allowed".to_string(),
        ));
    }
    if !is_suid && suid_required {
        return Err(Error::PrivilegeMismatch(
            "a setuid installation is required to join this instance".to_string(),
        ));
    }
    if record.pid <= 1 || record.ppid <= 1 {
        return Err(Error::InstanceIntegrity(
            "bad instance process ID found".to_string(),
        ));
    }
    Ok(suid_required)
}

// =============================================================================
// Procfs View
// =============================================================================

/// Read access to one process's procfs directory, relative paths only.
pub trait ProcView {
    fn read_link(&self, rel: &Path) -> io::Result<PathBuf>;
    fn owner(&self, rel: &Path) -> io::Result<(u32, u32)>;
    fn read_to_string(&self, rel: &Path) -> io::Result<String>;
}

/// A directory descriptor on `/proc/<pid>`.
///
/// Paths resolve through `/proc/self/fd/<fd>`, so they keep referring to the
/// opened process even if its PID is reused.
#[derive(Debug)]
pub struct ProcDir {
    dir: File,
    base: PathBuf,
}

impl ProcDir {
    pub fn open(pid: i32) -> Result<Self> {
        let path = PathBuf::from(format!("/proc/{}", pid));
        let dir = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(&path)
            .map_err(|e| Error::path_io(&path, e))?;
        let base = PathBuf::from(format!("/proc/self/fd/{}", dir.as_raw_fd()));
        Ok(Self { dir, base })
    }

    /// Consumes the view, returning the directory descriptor.
    pub fn into_file(self) -> File {
        self.dir
    }
}

impl ProcView for ProcDir {
    fn read_link(&self, rel: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(self.base.join(rel))
    }

    fn owner(&self, rel: &Path) -> io::Result<(u32, u32)> {
        let meta = std::fs::metadata(self.base.join(rel))?;
        Ok((meta.uid(), meta.gid()))
    }

    fn read_to_string(&self, rel: &Path) -> io::Result<String> {
        std::fs::read_to_string(self.base.join(rel))
    }
}

// =============================================================================
// Integrity Proofs
// =============================================================================

/// One authenticity predicate over an instance process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proof {
    NoUserNamespace,
    RootLinkDenied,
    TaskOwnership,
    ParentPid,
    ParentRootLinkDenied,
    ParentTaskOwnership,
    SupervisorComm,
}

impl Proof {
    /// Every proof, in evaluation order.
    pub const ALL: [Proof; 7] = [
        Self::NoUserNamespace,
        Self::RootLinkDenied,
        Self::TaskOwnership,
        Self::ParentPid,
        Self::ParentRootLinkDenied,
        Self::ParentTaskOwnership,
        Self::SupervisorComm,
    ];
}

/// Inputs shared by every proof.
#[derive(Debug, Clone, Copy)]
pub struct ProofContext {
    pub uid: u32,
    pub gid: u32,
    pub ppid: i32,
}

impl Proof {
    /// Evaluates this proof; `Err` carries the failure reason.
    pub fn check(self, view: &dyn ProcView, ctx: &ProofContext) -> std::result::Result<(), String> {
        let parent = PathBuf::from("..").join(ctx.ppid.to_string());
        match self {
            Self::NoUserNamespace => match view.read_to_string(Path::new("uid_map")) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(format!("failed to read user namespace mapping: {}", e)),
                Ok(content) => match first_host_id(&content) {
                    Some(hid) if hid > 0 => {
                        Err("trying to join an instance running with user namespace enabled".to_string())
                    }
                    _ => Ok(()),
                },
            },
            Self::RootLinkDenied => expect_denied(view, Path::new("root")),
            Self::TaskOwnership => expect_owner(view, Path::new("task"), ctx, "instance process"),
            Self::ParentPid => {
                let status = view
                    .read_to_string(Path::new("status"))
                    .map_err(|e| format!("could not read status: {}", e))?;
                match parse_status_ppid(&status) {
                    Some(ppid) if ppid > 1 && ppid == ctx.ppid => Ok(()),
                    _ => Err("orphaned (or faked) instance process".to_string()),
                }
            }
            Self::ParentRootLinkDenied => expect_denied(view, &parent.join("root")),
            Self::ParentTaskOwnership => {
                expect_owner(view, &parent.join("task"), ctx, "parent instance process")
            }
            Self::SupervisorComm => {
                let comm = view
                    .read_to_string(Path::new("comm"))
                    .map_err(|e| format!("failed to read comm: {}", e))?;
                if comm.trim_end_matches('\n') == INSTANCE_SUPERVISOR_COMM {
                    Ok(())
                } else {
                    Err(format!(
                        "{} not found in comm, wrong instance process",
                        INSTANCE_SUPERVISOR_COMM
                    ))
                }
            }
        }
    }
}

/// Runs every proof in order. The first failure aborts with
/// [`Error::InstanceIntegrity`].
pub fn verify(view: &dyn ProcView, ctx: &ProofContext) -> Result<()> {
    for proof in Proof::ALL {
        if let Err(reason) = proof.check(view, ctx) {
            debug!("instance proof {:?} failed: {}", proof, reason);
            return Err(Error::InstanceIntegrity(reason));
        }
    }
    Ok(())
}

fn expect_denied(view: &dyn ProcView, rel: &Path) -> std::result::Result<(), String> {
    match view.read_link(rel) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(()),
        _ => Err("trying to join a wrong instance process".to_string()),
    }
}

fn expect_owner(
    view: &dyn ProcView,
    rel: &Path,
    ctx: &ProofContext,
    what: &str,
) -> std::result::Result<(), String> {
    let (uid, gid) = view
        .owner(rel)
        .map_err(|e| format!("error while getting information for {} task directory: {}", what, e))?;
    if uid != ctx.uid || gid != ctx.gid {
        return Err(format!(
            "{} owned by {}:{} instead of {}:{}",
            what, uid, gid, ctx.uid, ctx.gid
        ));
    }
    Ok(())
}

/// Host ID of the first `uid_map` line.
fn first_host_id(content: &str) -> Option<u32> {
    content.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

/// Extracts `PPid:` from `/proc/<pid>/status` content.
pub fn parse_status_ppid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("PPid:"))
        .and_then(|v| v.trim().parse().ok())
}

// =============================================================================
// Cgroup Join
// =============================================================================

/// Extracts the unified hierarchy path (`0::/path`) from `/proc/<pid>/cgroup`.
pub fn unified_cgroup_path(content: &str) -> Option<&str> {
    content.lines().find_map(|l| l.strip_prefix("0::"))
}

/// Adds `member` to the cgroup of instance process `pid`.
pub fn join_cgroup(pid: i32, member: u32) -> Result<()> {
    join_cgroup_at(Path::new("/proc"), Path::new(CGROUP_ROOT), pid, member)
}

/// [`join_cgroup`] with explicit procfs and cgroupfs roots.
pub fn join_cgroup_at(proc_root: &Path, cgroup_root: &Path, pid: i32, member: u32) -> Result<()> {
    let cgroup_file = proc_root.join(pid.to_string()).join("cgroup");
    let content =
        std::fs::read_to_string(&cgroup_file).map_err(|e| Error::path_io(&cgroup_file, e))?;
    let rel = unified_cgroup_path(&content).ok_or_else(|| Error::ResourceUnavailable {
        resource: "cgroup v2".to_string(),
        reason: format!("no unified hierarchy entry in {}", cgroup_file.display()),
    })?;

    let procs = cgroup_root
        .join(rel.trim_start_matches('/'))
        .join("cgroup.procs");
    debug!("Adding process {} to instance cgroup {}", member, procs.display());
    std::fs::write(&procs, member.to_string()).map_err(|e| Error::path_io(&procs, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_ns: bool) -> InstanceRecord {
        InstanceRecord {
            name: "web".into(),
            pid: 4242,
            ppid: 4241,
            user_ns,
            cgroup: false,
            config: serde_json::Value::Null,
            created: None,
        }
    }

    #[test]
    fn test_join_privilege_matrix() {
        assert!(matches!(
            check_join_privilege(1000, false, &record(false)),
            Err(Error::PrivilegeMismatch(_))
        ));
        assert!(matches!(
            check_join_privilege(1000, true, &record(true)),
            Err(Error::PrivilegeMismatch(_))
        ));
        assert!(check_join_privilege(1000, true, &record(false)).unwrap());
        assert!(!check_join_privilege(1000, false, &record(true)).unwrap());
    }

    #[test]
    fn test_bad_pids_rejected() {
        let mut r = record(true);
        r.ppid = 1;
        assert!(matches!(
            check_join_privilege(1000, false, &r),
            Err(Error::InstanceIntegrity(_))
        ));
    }

    #[test]
    fn test_parse_status_ppid() {
        assert_eq!(parse_status_ppid("Name:\tsinit\nPPid:\t4241\n"), Some(4241));
        assert_eq!(parse_status_ppid("Name:\tsinit\n"), None);
    }

    #[test]
    fn test_unified_cgroup_path() {
        let content = "1:name=systemd:/x\n0::/user.slice/instance-web\n";
        assert_eq!(unified_cgroup_path(content), Some("/user.slice/instance-web"));
    }
}
