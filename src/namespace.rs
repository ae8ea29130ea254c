//! # Namespace Planner
//!
//! Decides which Linux namespaces the container process creates and which it
//! joins by path.
//!
//! A namespace with an empty path is created (its clone flag is set); a
//! namespace with a path is joined (the path lands in the matching starter
//! buffer). The mount namespace is always requested for fresh containers.
//!
//! ## Network Namespace Join
//!
//! Root may join any existing path. A non-root user needs **both**:
//!
//! 1. the path listed in `allow-netns-paths`, and
//! 2. membership in `allow-net-users` (name/UID) or `allow-net-groups`.

use crate::constants::{
    CLONE_NEWCGROUP, CLONE_NEWIPC, CLONE_NEWNET, CLONE_NEWNS, CLONE_NEWPID, CLONE_NEWUSER,
    CLONE_NEWUTS,
};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::policy::AdminPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Linux namespace kinds understood by the starter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    User,
    Ipc,
    Uts,
    Pid,
    Network,
    Mount,
    Cgroup,
}

impl NamespaceType {
    pub const ALL: [NamespaceType; 7] = [
        Self::User,
        Self::Ipc,
        Self::Uts,
        Self::Pid,
        Self::Network,
        Self::Mount,
        Self::Cgroup,
    ];

    /// Entry name under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Mount => "mnt",
            Self::Cgroup => "cgroup",
        }
    }

    /// `CLONE_NEW*` flag creating this namespace.
    pub fn clone_flag(self) -> u32 {
        match self {
            Self::User => CLONE_NEWUSER,
            Self::Ipc => CLONE_NEWIPC,
            Self::Uts => CLONE_NEWUTS,
            Self::Pid => CLONE_NEWPID,
            Self::Network => CLONE_NEWNET,
            Self::Mount => CLONE_NEWNS,
            Self::Cgroup => CLONE_NEWCGROUP,
        }
    }
}

impl std::fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Pid => "pid",
            Self::Network => "network",
            Self::Mount => "mount",
            Self::Cgroup => "cgroup",
        };
        f.write_str(name)
    }
}

/// One requested namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub kind: NamespaceType,
    /// Join target; `None` creates a new namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Namespace {
    pub fn create(kind: NamespaceType) -> Self {
        Self { kind, path: None }
    }

    pub fn join(kind: NamespaceType, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }
}

/// Ordered namespace request, at most one entry per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceSet(Vec<Namespace>);

impl NamespaceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `ns`, replacing any entry of the same kind.
    pub fn add_or_replace(&mut self, ns: Namespace) {
        match self.0.iter_mut().find(|n| n.kind == ns.kind) {
            Some(existing) => *existing = ns,
            None => self.0.push(ns),
        }
    }

    /// Removes the entry of `kind`, returning true if one was present.
    pub fn remove(&mut self, kind: NamespaceType) -> bool {
        let before = self.0.len();
        self.0.retain(|n| n.kind != kind);
        self.0.len() != before
    }

    pub fn has(&self, kind: NamespaceType) -> bool {
        self.0.iter().any(|n| n.kind == kind)
    }

    pub fn get(&self, kind: NamespaceType) -> Option<&Namespace> {
        self.0.iter().find(|n| n.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.0.iter()
    }

    /// Clone flags for namespaces that are created rather than joined.
    pub fn clone_flags(&self) -> u32 {
        self.0
            .iter()
            .filter(|n| n.path.is_none())
            .fold(0, |flags, n| flags | n.kind.clone_flag())
    }

    /// Join paths keyed by namespace kind.
    pub fn join_paths(&self) -> impl Iterator<Item = (NamespaceType, &Path)> {
        self.0
            .iter()
            .filter_map(|n| n.path.as_deref().map(|p| (n.kind, p)))
    }

    /// Rewrites every join path to `ns/<name>`, relative to `/proc/<pid>`.
    pub fn relative_to_proc(&mut self) {
        for ns in &mut self.0 {
            ns.path = Some(PathBuf::from("ns").join(ns.kind.proc_name()));
        }
    }
}

impl FromIterator<Namespace> for NamespaceSet {
    fn from_iter<I: IntoIterator<Item = Namespace>>(iter: I) -> Self {
        let mut set = Self::new();
        for ns in iter {
            set.add_or_replace(ns);
        }
        set
    }
}

// =============================================================================
// Policy Application
// =============================================================================

/// Applies administrator namespace toggles to a fresh-container request.
///
/// IPC, PID and UTS namespaces are removed with a warning. A user namespace
/// that is requested (or required by an unprivileged install) but disallowed
/// is fatal. `suid_install` is the installation mode, not whether this
/// launch runs setuid.
pub fn apply_policy(
    namespaces: &mut NamespaceSet,
    policy: &AdminPolicy,
    suid_install: bool,
    hostname_requested: bool,
) -> Result<()> {
    namespaces.add_or_replace(Namespace::create(NamespaceType::Mount));

    if !policy.allow_ipc_ns && namespaces.remove(NamespaceType::Ipc) {
        warn!("Not virtualizing ipc namespace by configuration");
    }
    if !policy.allow_pid_ns && namespaces.remove(NamespaceType::Pid) {
        warn!("Not virtualizing pid namespace by configuration");
    }
    if !policy.allow_user_ns {
        if !suid_install {
            return Err(Error::ConfigurationDisallowed(
                "user namespace, required by an unprivileged installation".to_string(),
            ));
        }
        if namespaces.has(NamespaceType::User) {
            return Err(Error::ConfigurationDisallowed(
                "user namespace, required by this container".to_string(),
            ));
        }
    }
    if !policy.allow_uts_ns {
        if namespaces.remove(NamespaceType::Uts) {
            warn!("Not virtualizing uts namespace by configuration");
        }
        if hostname_requested {
            warn!("Container hostname cannot be set.");
        }
    }
    Ok(())
}

/// Validates a requested network namespace join.
///
/// Returns the join path when one is requested and authorized.
pub fn authorize_netns_join(
    namespaces: &NamespaceSet,
    policy: &AdminPolicy,
    identity: &Identity,
) -> Result<Option<PathBuf>> {
    let Some(path) = namespaces
        .get(NamespaceType::Network)
        .and_then(|n| n.path.clone())
    else {
        return Ok(None);
    };

    std::fs::metadata(&path).map_err(|e| Error::path_io(&path, e))?;

    if identity.euid == 0 {
        debug!("root joining network namespace {}", path.display());
        return Ok(Some(path));
    }

    let allowed_user = identity.in_user_list(&policy.allow_net_users);
    let allowed_group = identity.in_any_group(&policy.allow_net_groups);
    let permitted_path = policy.allow_netns_paths.iter().any(|p| p == &path);

    if !permitted_path {
        return Err(Error::ConfigurationDisallowed(format!(
            "{} as a network namespace path (not in allow-netns-paths)",
            path.display()
        )));
    }
    if !allowed_user && !allowed_group {
        return Err(Error::ConfigurationDisallowed(
            "you from joining network namespaces".to_string(),
        ));
    }
    Ok(Some(path))
}
