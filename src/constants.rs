//! # Launch Constants
//!
//! Bounds, flags, timeouts and well-known paths shared by the preparation
//! pipeline, the starter channel and the lifecycle handlers. The starter
//! bounds mirror the fixed layout read by the native process-creation stage
//! and must not drift from it.
//!
//! ## Cross-References
//!
//! - [`crate::starter`]: fixed-size buffers sized by the `MAX_*` constants
//! - [`crate::engine`]: default policy and device paths
//! - [`crate::lifecycle`]: handshake status bytes and timeouts

use std::time::Duration;

// =============================================================================
// Starter Channel Bounds
// =============================================================================
//
// The native stage reads these as fixed-size C arrays. Every writer in
// `starter.rs` checks against them before a single byte reaches shared memory.
// =============================================================================

/// Capacity of each UID/GID map text buffer, including the NUL terminator.
pub const MAX_MAP_SIZE: usize = 4096;

/// Capacity of each path buffer (namespace join paths, helper binaries).
pub const MAX_PATH_SIZE: usize = 4096;

/// Maximum number of target group IDs for the container process.
pub const MAX_GID: usize = 32;

/// Maximum number of file descriptors kept open across stage 1.
///
/// **Security**: descriptors not listed are closed before the container
/// process starts, so this is also the upper bound on what can leak into it.
pub const MAX_STARTER_FDS: usize = 1024;

/// Default capacity reserved for the engine JSON payload (1 MiB).
pub const DEFAULT_ENGINE_CONFIG_CAPACITY: usize = 1024 * 1024;

// =============================================================================
// Namespace Clone Flags
// =============================================================================

pub const CLONE_NEWNS: u32 = 0x0002_0000;
pub const CLONE_NEWCGROUP: u32 = 0x0200_0000;
pub const CLONE_NEWUTS: u32 = 0x0400_0000;
pub const CLONE_NEWIPC: u32 = 0x0800_0000;
pub const CLONE_NEWUSER: u32 = 0x1000_0000;
pub const CLONE_NEWPID: u32 = 0x2000_0000;
pub const CLONE_NEWNET: u32 = 0x4000_0000;

// =============================================================================
// Mount Propagation Flags
// =============================================================================

pub const MS_REC: u64 = 0x4000;
pub const MS_UNBINDABLE: u64 = 1 << 17;
pub const MS_PRIVATE: u64 = 1 << 18;
pub const MS_SLAVE: u64 = 1 << 19;
pub const MS_SHARED: u64 = 1 << 20;

// =============================================================================
// Lifecycle Handshake
// =============================================================================

/// Status byte written back when a host-side task completed.
pub const LIFECYCLE_COMPLETE: u8 = b'c';

/// Status byte written back when a host-side task failed.
pub const LIFECYCLE_FAILED: u8 = b'f';

/// Bound on a lazy FUSE unmount helper invocation.
///
/// **Rationale**: a wedged `fusermount` would otherwise block the handshake
/// and leave the master waiting forever.
pub const FUSE_UNMOUNT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on waiting for the post-start trigger byte.
///
/// The post-start trigger is written by the master right after the
/// container process starts, unlike the cleanup trigger which waits for
/// container exit and is unbounded.
pub const POST_START_TRIGGER_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound on writing the one-byte status reply.
pub const LIFECYCLE_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Build Configuration
// =============================================================================

/// Built for a setuid installation.
pub const SUID_INSTALL: bool = cfg!(feature = "suid-install");

// =============================================================================
// Well-Known Paths
// =============================================================================

/// Default administrator policy file.
pub const DEFAULT_POLICY_FILE: &str = "/etc/stagehand/stagehand.yaml";

/// Default capability authorization table.
pub const DEFAULT_CAPABILITY_FILE: &str = "/etc/stagehand/capability.json";

/// Subordinate UID ranges.
pub const SUBUID_FILE: &str = "/etc/subuid";

/// Subordinate GID ranges.
pub const SUBGID_FILE: &str = "/etc/subgid";

/// Mount table of the calling process.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// FUSE control device.
pub const DEV_FUSE: &str = "/dev/fuse";

/// Kernel filesystem table.
pub const PROC_FILESYSTEMS: &str = "/proc/filesystems";

/// Root of the unified cgroup hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Command name of the instance supervisor process.
pub const INSTANCE_SUPERVISOR_COMM: &str = "sinit";

/// Sub-directory of the user's home holding instance records.
pub const INSTANCE_DIR: &str = ".stagehand/instances";

/// Fallback search path for ID-mapping helpers when `PATH` is unset.
pub const DEFAULT_SEARCH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Oldest kernel release supporting overlay mounts inside a user namespace.
pub const ROOTLESS_OVERLAY_KERNEL: (u32, u32) = (5, 11);
