//! # Starter Configuration Channel
//!
//! The finished launch plan reaches the native process-creation stage through
//! a fixed-layout shared memory region. Writing happens in two steps:
//!
//! 1. Preparation fills a local [`StarterPlan`]. Nothing shared is touched,
//!    so an error anywhere simply drops the plan.
//! 2. [`StarterRegion::publish`] validates every bounded field against the
//!    region capacities and only then copies the plan in. A failed
//!    validation leaves the region exactly as it was.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────┐ offset 0
//! │ RawStarterConfig             │
//! │   container                  │  pid, instance flag, privileges,
//! │                              │  namespaces (flags + 7 join paths)
//! │   starter                    │  cwd fd, image fd, kept fds[1024]
//! │   engine                     │  size, capacity, payload pointer
//! ├──────────────────────────────┤ offset size_of::<RawStarterConfig>()
//! │ engine JSON payload          │
//! └──────────────────────────────┘
//! ```
//!
//! ## Release
//!
//! [`StarterRegion::release`] consumes the region, so it cannot be touched
//! afterwards. Dropping an unreleased region unmaps it as well.

use crate::capabilities::{CapabilityMasks, OciCapabilities};
use crate::constants::{
    MAX_GID, MAX_MAP_SIZE, MAX_PATH_SIZE, MAX_STARTER_FDS, MS_PRIVATE, MS_REC, MS_SHARED,
    MS_SLAVE, MS_UNBINDABLE,
};
use crate::error::{Error, Result};
use crate::idmap::{IdMapping, serialize_map};
use crate::namespace::{NamespaceSet, NamespaceType};
use serde::Serialize;
use std::collections::BTreeMap;
use std::mem::ManuallyDrop;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr::NonNull;
use tracing::{debug, warn};

// =============================================================================
// Shared Layout
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy)]
struct RawCapabilities {
    permitted: u64,
    effective: u64,
    inheritable: u64,
    bounding: u64,
    ambient: u64,
}

#[repr(C)]
struct RawNamespace {
    flags: libc::c_uint,
    mount_propagation: libc::c_ulong,
    join_only: bool,
    bring_loopback_interface: bool,
    network: [u8; MAX_PATH_SIZE],
    mount: [u8; MAX_PATH_SIZE],
    user: [u8; MAX_PATH_SIZE],
    ipc: [u8; MAX_PATH_SIZE],
    uts: [u8; MAX_PATH_SIZE],
    cgroup: [u8; MAX_PATH_SIZE],
    pid: [u8; MAX_PATH_SIZE],
}

#[repr(C)]
struct RawPrivileges {
    no_new_privs: bool,
    uid_map: [u8; MAX_MAP_SIZE],
    gid_map: [u8; MAX_MAP_SIZE],
    allow_setgroups: bool,
    no_setgroups: bool,
    newuidmap_path: [u8; MAX_PATH_SIZE],
    newgidmap_path: [u8; MAX_PATH_SIZE],
    target_uid: libc::uid_t,
    target_gid: [libc::gid_t; MAX_GID],
    num_gid: libc::c_int,
    capabilities: RawCapabilities,
}

#[repr(C)]
struct RawContainer {
    pid: libc::pid_t,
    is_instance: bool,
    privileges: RawPrivileges,
    namespace: RawNamespace,
}

#[repr(C)]
struct RawStarter {
    working_directory_fd: libc::c_int,
    image_fd: libc::c_int,
    fds: [libc::c_int; MAX_STARTER_FDS],
    numfds: libc::c_int,
    is_suid: bool,
    master_propagate_mount: bool,
    hybrid_workflow: bool,
    nv_ccli_caps: bool,
}

#[repr(C)]
struct RawEngine {
    size: libc::size_t,
    map_size: libc::size_t,
    config: *mut libc::c_char,
}

#[repr(C)]
struct RawStarterConfig {
    container: RawContainer,
    starter: RawStarter,
    engine: RawEngine,
}

/// Bytes before the engine payload.
const HEADER_LEN: usize = std::mem::size_of::<RawStarterConfig>();

// =============================================================================
// Local Plan
// =============================================================================

/// The launch plan, built locally and published once.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StarterPlan {
    pub clone_flags: u32,
    pub join_paths: BTreeMap<NamespaceType, PathBuf>,
    pub mount_propagation: u64,
    pub join_only: bool,
    pub bring_loopback_interface: bool,

    pub no_new_privs: bool,
    pub uid_map: Vec<IdMapping>,
    pub gid_map: Vec<IdMapping>,
    pub allow_setgroups: bool,
    pub no_setgroups: bool,
    pub newuidmap_path: Option<PathBuf>,
    pub newgidmap_path: Option<PathBuf>,
    pub target_uid: u32,
    pub target_gids: Vec<u32>,
    pub capabilities: CapabilityMasks,

    pub is_instance: bool,
    pub working_directory_fd: Option<RawFd>,
    pub image_fd: Option<RawFd>,
    pub kept_fds: Vec<RawFd>,
    pub master_propagate_mount: bool,
    pub hybrid_workflow: bool,
    pub nv_ccli_caps: bool,
}

impl StarterPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor that must survive process creation.
    pub fn keep_fd(&mut self, fd: RawFd) -> Result<()> {
        if self.kept_fds.len() >= MAX_STARTER_FDS {
            return Err(Error::CapacityExceeded {
                field: "kept file descriptors".to_string(),
                limit: MAX_STARTER_FDS,
            });
        }
        self.kept_fds.push(fd);
        Ok(())
    }

    /// Sets the target GIDs, keeping at most [`MAX_GID`].
    pub fn set_target_gids(&mut self, gids: &[u32]) {
        if gids.len() > MAX_GID {
            warn!("you can't specify more than {} group IDs", MAX_GID);
        }
        self.target_gids = gids.iter().copied().take(MAX_GID).collect();
    }

    /// Converts a propagation name (`rslave`, `private`, ...) to mount flags.
    pub fn set_mount_propagation(&mut self, propagation: &str) {
        let base = propagation.strip_prefix('r').unwrap_or(propagation);
        let mut flags = match base {
            "shared" => MS_SHARED,
            "slave" => MS_SLAVE,
            "private" => MS_PRIVATE,
            "unbindable" => MS_UNBINDABLE,
            _ => 0,
        };
        if propagation.starts_with('r') {
            flags |= MS_REC;
        }
        self.mount_propagation = flags;
    }

    /// Clone flags for created namespaces.
    pub fn set_namespace_flags(&mut self, namespaces: &NamespaceSet) {
        self.clone_flags = namespaces.clone_flags();
    }

    /// Join paths for joined namespaces.
    pub fn set_namespace_paths(&mut self, namespaces: &NamespaceSet) {
        for (kind, path) in namespaces.join_paths() {
            self.join_paths.insert(kind, path.to_path_buf());
        }
    }

    pub fn set_capabilities(&mut self, caps: &OciCapabilities) {
        self.capabilities = caps.bitmasks();
    }

    /// Checks every bounded field against the shared layout.
    pub fn validate(&self) -> Result<()> {
        serialize_map("uid map", &self.uid_map)?;
        serialize_map("gid map", &self.gid_map)?;

        for (kind, path) in &self.join_paths {
            check_path(&format!("{} namespace path", kind), path)?;
        }
        if let Some(p) = &self.newuidmap_path {
            check_path("newuidmap path", p)?;
        }
        if let Some(p) = &self.newgidmap_path {
            check_path("newgidmap path", p)?;
        }
        if self.target_gids.len() > MAX_GID {
            return Err(Error::CapacityExceeded {
                field: "target group IDs".to_string(),
                limit: MAX_GID,
            });
        }
        if self.kept_fds.len() > MAX_STARTER_FDS {
            return Err(Error::CapacityExceeded {
                field: "kept file descriptors".to_string(),
                limit: MAX_STARTER_FDS,
            });
        }
        Ok(())
    }
}

fn check_path(field: &str, path: &std::path::Path) -> Result<()> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() > MAX_PATH_SIZE - 1 {
        return Err(Error::CapacityExceeded {
            field: field.to_string(),
            limit: MAX_PATH_SIZE - 1,
        });
    }
    if bytes.contains(&0) {
        return Err(Error::InvalidConfiguration(format!("{} contains a NUL byte", field)));
    }
    Ok(())
}

/// Zero-fills `dst` and copies `src` in, leaving a NUL terminator.
fn copy_cstr(dst: &mut [u8], src: &[u8]) {
    dst.fill(0);
    dst[..src.len()].copy_from_slice(src);
}

/// Kept descriptors must survive `execve` of the next stage.
fn clear_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: F_GETFD/F_SETFD only read and write descriptor flags; an
    // invalid fd yields -1 with EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::sys("fcntl(F_GETFD)", nix::Error::last()));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(Error::sys("fcntl(F_SETFD)", nix::Error::last()));
    }
    Ok(())
}

// =============================================================================
// Shared Region
// =============================================================================

/// Values set by the native stage before preparation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageInfo {
    pub is_suid: bool,
    pub container_pid: i32,
}

/// A mapped starter configuration region.
pub struct StarterRegion {
    base: NonNull<RawStarterConfig>,
    len: usize,
}

impl std::fmt::Debug for StarterRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StarterRegion")
            .field("len", &self.len)
            .field("engine_capacity", &self.engine_capacity())
            .finish()
    }
}

impl StarterRegion {
    /// Maps a fresh shared anonymous region with `engine_capacity` bytes of
    /// payload space.
    pub fn map_anonymous(engine_capacity: usize, stage: StageInfo) -> Result<Self> {
        let len = HEADER_LEN + engine_capacity;
        // SAFETY: anonymous shared mapping, no file backing; the kernel
        // returns zeroed pages or MAP_FAILED.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        let mut region = Self::from_mapping(addr, len)?;
        let raw = region.raw_mut();
        raw.container.pid = stage.container_pid;
        raw.starter.is_suid = stage.is_suid;
        raw.starter.working_directory_fd = -1;
        raw.starter.image_fd = -1;
        Ok(region)
    }

    /// Maps the region shared through descriptor `fd` by the native stage.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        // SAFETY: fstat fills a caller-owned stat buffer.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: `st` is a valid, writable stat buffer.
        if unsafe { libc::fstat(fd, &mut st) } < 0 {
            return Err(Error::sys("fstat", nix::Error::last()));
        }
        let len = usize::try_from(st.st_size).unwrap_or(0);
        if len <= HEADER_LEN {
            return Err(Error::InvalidConfiguration(format!(
                "starter region of {} bytes is smaller than its header ({} bytes)",
                len, HEADER_LEN
            )));
        }
        // SAFETY: maps `len` bytes of a file we just measured; failure is
        // reported as MAP_FAILED.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        Self::from_mapping(addr, len)
    }

    fn from_mapping(addr: *mut libc::c_void, len: usize) -> Result<Self> {
        if addr == libc::MAP_FAILED {
            return Err(Error::sys("mmap", nix::Error::last()));
        }
        let base = NonNull::new(addr.cast::<RawStarterConfig>())
            .ok_or_else(|| Error::Internal("mmap returned a null mapping".to_string()))?;
        let mut region = Self { base, len };
        let capacity = region.engine_capacity();
        let raw = region.raw_mut();
        raw.engine.map_size = capacity;
        // SAFETY: the payload starts right after the header inside the same
        // mapping of `len` bytes.
        raw.engine.config = unsafe { addr.cast::<u8>().add(HEADER_LEN) }.cast();
        debug!("mapped starter region of {} bytes", len);
        Ok(region)
    }

    fn raw(&self) -> &RawStarterConfig {
        // SAFETY: `base` points to a live mapping of at least HEADER_LEN
        // bytes, and `&self` prevents concurrent mutation through this handle.
        unsafe { self.base.as_ref() }
    }

    fn raw_mut(&mut self) -> &mut RawStarterConfig {
        // SAFETY: as in `raw`, with exclusive access through `&mut self`.
        unsafe { self.base.as_mut() }
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        let capacity = self.engine_capacity();
        // SAFETY: the payload area spans `capacity` bytes after the header,
        // inside the mapping.
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().cast::<u8>().add(HEADER_LEN), capacity)
        }
    }

    /// Bytes available for the engine JSON payload.
    pub fn engine_capacity(&self) -> usize {
        self.len - HEADER_LEN
    }

    /// Set by the native stage: the starter runs setuid.
    pub fn is_suid(&self) -> bool {
        self.raw().starter.is_suid
    }

    /// Set by the native stage once the container process exists.
    pub fn container_pid(&self) -> i32 {
        self.raw().container.pid
    }

    /// Validates `plan` and the payload, then copies both into the region.
    pub fn publish(&mut self, plan: &StarterPlan, engine_json: &[u8]) -> Result<()> {
        plan.validate()?;
        let uid_map = serialize_map("uid map", &plan.uid_map)?;
        let gid_map = serialize_map("gid map", &plan.gid_map)?;
        if engine_json.len() >= self.engine_capacity() {
            return Err(Error::CapacityExceeded {
                field: "engine configuration".to_string(),
                limit: self.engine_capacity(),
            });
        }
        for &fd in &plan.kept_fds {
            clear_cloexec(fd)?;
        }

        let raw = self.raw_mut();

        let ns = &mut raw.container.namespace;
        ns.flags = plan.clone_flags;
        ns.mount_propagation = plan.mount_propagation as libc::c_ulong;
        ns.join_only = plan.join_only;
        ns.bring_loopback_interface = plan.bring_loopback_interface;
        for kind in NamespaceType::ALL {
            let path = plan
                .join_paths
                .get(&kind)
                .map(|p| p.as_os_str().as_bytes())
                .unwrap_or_default();
            let dst = match kind {
                NamespaceType::Network => &mut ns.network,
                NamespaceType::Mount => &mut ns.mount,
                NamespaceType::User => &mut ns.user,
                NamespaceType::Ipc => &mut ns.ipc,
                NamespaceType::Uts => &mut ns.uts,
                NamespaceType::Cgroup => &mut ns.cgroup,
                NamespaceType::Pid => &mut ns.pid,
            };
            copy_cstr(dst, path);
        }

        let privs = &mut raw.container.privileges;
        privs.no_new_privs = plan.no_new_privs;
        copy_cstr(&mut privs.uid_map, uid_map.as_bytes());
        copy_cstr(&mut privs.gid_map, gid_map.as_bytes());
        privs.allow_setgroups = plan.allow_setgroups;
        privs.no_setgroups = plan.no_setgroups;
        let helper = |p: &Option<PathBuf>| -> Vec<u8> {
            p.as_ref()
                .map(|p| p.as_os_str().as_bytes().to_vec())
                .unwrap_or_default()
        };
        copy_cstr(&mut privs.newuidmap_path, &helper(&plan.newuidmap_path));
        copy_cstr(&mut privs.newgidmap_path, &helper(&plan.newgidmap_path));
        privs.target_uid = plan.target_uid;
        privs.target_gid = [0; MAX_GID];
        privs.target_gid[..plan.target_gids.len()].copy_from_slice(&plan.target_gids);
        privs.num_gid = plan.target_gids.len() as libc::c_int;
        privs.capabilities = RawCapabilities {
            permitted: plan.capabilities.permitted,
            effective: plan.capabilities.effective,
            inheritable: plan.capabilities.inheritable,
            bounding: plan.capabilities.bounding,
            ambient: plan.capabilities.ambient,
        };
        raw.container.is_instance = plan.is_instance;

        let starter = &mut raw.starter;
        starter.working_directory_fd = plan.working_directory_fd.unwrap_or(-1);
        starter.image_fd = plan.image_fd.unwrap_or(-1);
        starter.fds = [0; MAX_STARTER_FDS];
        starter.fds[..plan.kept_fds.len()].copy_from_slice(&plan.kept_fds);
        starter.numfds = plan.kept_fds.len() as libc::c_int;
        starter.master_propagate_mount = plan.master_propagate_mount;
        starter.hybrid_workflow = plan.hybrid_workflow;
        starter.nv_ccli_caps = plan.nv_ccli_caps;

        raw.engine.size = engine_json.len();
        let payload = self.payload_mut();
        payload.fill(0);
        payload[..engine_json.len()].copy_from_slice(engine_json);

        debug!(
            "published starter plan: flags={:#x} fds={} engine={} bytes",
            plan.clone_flags,
            plan.kept_fds.len(),
            engine_json.len()
        );
        Ok(())
    }

    /// Engine JSON payload as last published.
    pub fn engine_json(&self) -> Vec<u8> {
        let size = self.raw().engine.size.min(self.engine_capacity());
        // SAFETY: `size` is clamped to the payload capacity inside the mapping.
        unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().cast::<u8>().add(HEADER_LEN), size)
        }
        .to_vec()
    }

    /// Namespace clone flags as published.
    pub fn clone_flags(&self) -> u32 {
        self.raw().container.namespace.flags
    }

    pub fn mount_propagation(&self) -> u64 {
        self.raw().container.namespace.mount_propagation as u64
    }

    /// Join path of `kind`, empty when the namespace is not joined.
    pub fn join_path(&self, kind: NamespaceType) -> String {
        let ns = &self.raw().container.namespace;
        let buf = match kind {
            NamespaceType::Network => &ns.network,
            NamespaceType::Mount => &ns.mount,
            NamespaceType::User => &ns.user,
            NamespaceType::Ipc => &ns.ipc,
            NamespaceType::Uts => &ns.uts,
            NamespaceType::Cgroup => &ns.cgroup,
            NamespaceType::Pid => &ns.pid,
        };
        c_text(buf)
    }

    pub fn uid_map(&self) -> String {
        c_text(&self.raw().container.privileges.uid_map)
    }

    pub fn gid_map(&self) -> String {
        c_text(&self.raw().container.privileges.gid_map)
    }

    pub fn capabilities(&self) -> CapabilityMasks {
        let c = self.raw().container.privileges.capabilities;
        CapabilityMasks {
            permitted: c.permitted,
            effective: c.effective,
            inheritable: c.inheritable,
            bounding: c.bounding,
            ambient: c.ambient,
        }
    }

    pub fn kept_fds(&self) -> Vec<RawFd> {
        let starter = &self.raw().starter;
        let n = usize::try_from(starter.numfds).unwrap_or(0).min(MAX_STARTER_FDS);
        starter.fds[..n].to_vec()
    }

    pub fn working_directory_fd(&self) -> RawFd {
        self.raw().starter.working_directory_fd
    }

    pub fn target_ids(&self) -> (u32, Vec<u32>) {
        let privs = &self.raw().container.privileges;
        let n = usize::try_from(privs.num_gid).unwrap_or(0).min(MAX_GID);
        (privs.target_uid, privs.target_gid[..n].to_vec())
    }

    pub fn no_new_privs(&self) -> bool {
        self.raw().container.privileges.no_new_privs
    }

    pub fn join_only(&self) -> bool {
        self.raw().container.namespace.join_only
    }

    /// Unmaps the region. The region cannot be used afterwards.
    pub fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        this.unmap()
    }

    fn unmap(&self) -> Result<()> {
        // SAFETY: `base`/`len` describe exactly the mapping created in
        // `from_mapping`; callers guarantee it is unmapped only once.
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) } != 0 {
            return Err(Error::sys("munmap", nix::Error::last()));
        }
        Ok(())
    }
}

impl Drop for StarterRegion {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!("failed to release starter region: {}", e);
        }
    }
}

fn c_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
