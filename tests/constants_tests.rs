//! Tests for constants module.
//!
//! Validates that the starter channel bounds and handshake bytes keep the
//! values the native stage expects.

use stagehand::constants::*;

// =============================================================================
// Starter Bound Tests
// =============================================================================

#[test]
fn test_starter_bounds() {
    assert_eq!(MAX_MAP_SIZE, 4096);
    assert_eq!(MAX_PATH_SIZE, 4096);
    assert_eq!(MAX_GID, 32);
    assert_eq!(MAX_STARTER_FDS, 1024);
}

#[test]
fn test_engine_capacity_holds_typical_payload() {
    assert!(
        DEFAULT_ENGINE_CONFIG_CAPACITY >= 64 * 1024,
        "engine payload capacity too small for a full configuration"
    );
}

// =============================================================================
// Flag Tests
// =============================================================================

#[test]
fn test_clone_flags_are_distinct_bits() {
    let flags = [
        CLONE_NEWNS,
        CLONE_NEWCGROUP,
        CLONE_NEWUTS,
        CLONE_NEWIPC,
        CLONE_NEWUSER,
        CLONE_NEWPID,
        CLONE_NEWNET,
    ];
    let mut seen = 0u32;
    for flag in flags {
        assert_eq!(flag.count_ones(), 1, "clone flag {:#x} is not a single bit", flag);
        assert_eq!(seen & flag, 0, "clone flag {:#x} overlaps", flag);
        seen |= flag;
    }
}

#[test]
fn test_clone_flags_match_kernel_values() {
    assert_eq!(CLONE_NEWNS as i32, libc::CLONE_NEWNS);
    assert_eq!(CLONE_NEWUSER as i32, libc::CLONE_NEWUSER);
    assert_eq!(CLONE_NEWNET as i32, libc::CLONE_NEWNET);
}

#[test]
fn test_propagation_flags_match_kernel_values() {
    assert_eq!(MS_REC, libc::MS_REC as u64);
    assert_eq!(MS_SLAVE, libc::MS_SLAVE as u64);
    assert_eq!(MS_PRIVATE, libc::MS_PRIVATE as u64);
    assert_eq!(MS_SHARED, libc::MS_SHARED as u64);
}

// =============================================================================
// Handshake Tests
// =============================================================================

#[test]
fn test_status_bytes() {
    assert_eq!(LIFECYCLE_COMPLETE, 0x63);
    assert_eq!(LIFECYCLE_FAILED, 0x66);
}

#[test]
fn test_post_start_wait_exceeds_unmount_bound() {
    assert!(POST_START_TRIGGER_TIMEOUT > FUSE_UNMOUNT_TIMEOUT);
    assert!(LIFECYCLE_REPLY_TIMEOUT.as_secs() > 0);
}
