//! Tests for capabilities module.
//!
//! Covers root defaults, the enforced (setuid) user path, drop precedence
//! and idempotence of resolution.

use caps::Capability;
use stagehand::capabilities::{
    CapabilityRequest, CapabilitySet, OciCapabilities, resolve_root, resolve_user,
};
use stagehand::identity::{GroupEntry, Identity};
use stagehand::policy::{CapabilityConfig, RootCapsMode};

fn user(uid: u32, name: &str, groups: &[(u32, &str)]) -> Identity {
    Identity {
        uid,
        gid: uid,
        euid: uid,
        username: name.to_string(),
        home: format!("/home/{}", name),
        shell: "/bin/sh".to_string(),
        gecos: String::new(),
        groups: groups
            .iter()
            .map(|(gid, name)| GroupEntry {
                gid: *gid,
                name: name.to_string(),
            })
            .collect(),
    }
}

fn table() -> CapabilityConfig {
    CapabilityConfig::from_json(
        r#"{
            "users": {"alice": ["CAP_NET_RAW"], "root": ["CAP_CHOWN"]},
            "groups": {"netadm": ["CAP_NET_ADMIN"], "wheel": ["CAP_KILL"]}
        }"#,
    )
    .unwrap()
}

fn request(add: &[&str], drop: &[&str]) -> CapabilityRequest {
    CapabilityRequest {
        add: add.iter().map(|s| s.to_string()).collect(),
        drop: drop.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

// =============================================================================
// Root Path Tests
// =============================================================================

#[test]
fn test_root_full_default() {
    let root = user(0, "root", &[]);
    let resolved = resolve_root(&root, &table(), RootCapsMode::Full, &request(&[], &[]));
    assert_eq!(resolved.set, CapabilitySet::full());
    assert!(!resolved.no_new_privileges);
}

#[test]
fn test_root_file_default_uses_user_and_groups() {
    let root = user(0, "root", &[(10, "wheel")]);
    let resolved = resolve_root(&root, &table(), RootCapsMode::File, &request(&[], &[]));
    assert!(resolved.set.contains(Capability::CAP_CHOWN));
    assert!(resolved.set.contains(Capability::CAP_KILL));
    assert!(!resolved.set.contains(Capability::CAP_SYS_ADMIN));
}

#[test]
fn test_root_no_privs_forces_empty_and_nnp() {
    let root = user(0, "root", &[]);
    let mut req = request(&["CAP_NET_RAW"], &[]);
    req.no_privs = true;
    let resolved = resolve_root(&root, &table(), RootCapsMode::Full, &req);
    assert!(resolved.no_new_privileges);
    assert_eq!(resolved.set.names(), vec!["CAP_NET_RAW"]);
}

#[test]
fn test_root_target_ids_disable_default_capabilities() {
    let root = user(0, "root", &[]);
    let mut req = request(&[], &[]);
    req.target_ids = true;
    let resolved = resolve_root(&root, &table(), RootCapsMode::Full, &req);
    assert!(resolved.set.is_empty());
    assert!(resolved.no_new_privileges);
}

#[test]
fn test_root_drop_wins_over_default() {
    let root = user(0, "root", &[]);
    let resolved = resolve_root(
        &root,
        &table(),
        RootCapsMode::Full,
        &request(&[], &["sys_admin"]),
    );
    assert!(!resolved.set.contains(Capability::CAP_SYS_ADMIN));
    assert!(resolved.set.contains(Capability::CAP_CHOWN));
}

// =============================================================================
// User Path Tests
// =============================================================================

#[test]
fn test_enforced_user_only_gets_authorized_caps() {
    let alice = user(1000, "alice", &[(2000, "netadm")]);
    let resolved = resolve_user(
        &alice,
        &table(),
        true,
        &request(&["CAP_NET_RAW", "CAP_NET_ADMIN", "CAP_SYS_ADMIN"], &[]),
    );
    assert!(resolved.set.contains(Capability::CAP_NET_RAW));
    assert!(resolved.set.contains(Capability::CAP_NET_ADMIN));
    assert!(!resolved.set.contains(Capability::CAP_SYS_ADMIN));
    assert!(resolved.no_new_privileges);
}

#[test]
fn test_enforced_result_is_subset_of_request() {
    let alice = user(1000, "alice", &[(2000, "netadm"), (10, "wheel")]);
    let cases: &[&[&str]] = &[
        &[],
        &["CAP_KILL"],
        &["CAP_NET_RAW", "CAP_CHOWN"],
        &["ALL"],
        &["bogus", "CAP_NET_ADMIN"],
    ];
    for add in cases {
        let req = request(add, &[]);
        let requested = CapabilitySet::from_names(&req.add);
        let resolved = resolve_user(&alice, &table(), true, &req);
        assert!(
            resolved.set.is_subset(&requested),
            "granted more than requested for {:?}",
            add
        );
    }
}

#[test]
fn test_unenforced_user_gets_every_add() {
    let bob = user(1001, "bob", &[]);
    let resolved = resolve_user(&bob, &table(), false, &request(&["CAP_SYS_ADMIN"], &[]));
    assert!(resolved.set.contains(Capability::CAP_SYS_ADMIN));
    assert!(resolved.no_new_privileges);
}

#[test]
fn test_existing_caps_are_reauthorized() {
    let bob = user(1001, "bob", &[]);
    let mut req = request(&[], &[]);
    req.existing = vec!["CAP_SYS_ADMIN".to_string()];
    let resolved = resolve_user(&bob, &table(), true, &req);
    assert!(resolved.set.is_empty(), "bob has no grant for restored capabilities");
}

#[test]
fn test_unknown_names_are_ignored() {
    let bob = user(1001, "bob", &[]);
    let resolved = resolve_user(&bob, &table(), false, &request(&["CAP_NOPE"], &["CAP_ALSO_NOPE"]));
    assert!(resolved.set.is_empty());
}

// =============================================================================
// Idempotence Tests
// =============================================================================

#[test]
fn test_resolution_is_idempotent() {
    let alice = user(1000, "alice", &[(2000, "netadm")]);
    let req = request(&["CAP_NET_RAW", "CAP_NET_ADMIN", "CAP_CHOWN"], &["CAP_NET_ADMIN"]);
    let first = resolve_user(&alice, &table(), true, &req);
    let second = resolve_user(&alice, &table(), true, &req);
    assert_eq!(first, second);

    let root = user(0, "root", &[]);
    let a = resolve_root(&root, &table(), RootCapsMode::File, &req);
    let b = resolve_root(&root, &table(), RootCapsMode::File, &req);
    assert_eq!(a, b);
}

#[test]
fn test_flattened_masks_round_into_bitmasks() {
    let set = CapabilitySet::from_names(&["CAP_NET_RAW", "CAP_KILL"]);
    let masks = OciCapabilities::flattened(set).bitmasks();
    assert_eq!(masks.permitted, set.bits());
    assert_eq!(masks.ambient, set.bits());
}
