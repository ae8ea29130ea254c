//! Tests for policy module.
//!
//! Covers the configuration file spelling, source overrides and the root
//! ownership requirement of the setuid workflow.

use stagehand::policy::{
    AdminPolicy, CapabilityConfig, OverlayMode, PolicySources, RootCapsMode, ensure_root_owned,
};
use stagehand::{Error, ErrorCategory};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn sources(dir: &Path) -> PolicySources {
    PolicySources {
        config_file: dir.join("stagehand.conf"),
        capability_file: dir.join("capability.json"),
        subuid_file: dir.join("subuid"),
        subgid_file: dir.join("subgid"),
    }
}

// =============================================================================
// Parsing Tests
// =============================================================================

#[test]
fn test_yes_no_spelling() {
    let policy = AdminPolicy::from_yaml(
        "allow-setuid: no\nallow-pid-ns: yes\nenable-underlay: off\nmount-slave: false\n",
    )
    .unwrap();
    assert!(!policy.allow_setuid);
    assert!(policy.allow_pid_ns);
    assert!(!policy.enable_underlay);
    assert_eq!(policy.mount_propagation(), "rprivate");
}

#[test]
fn test_bad_toggle_value_rejected() {
    assert!(AdminPolicy::from_yaml("allow-setuid: maybe\n").is_err());
}

#[test]
fn test_directive_enums() {
    let policy =
        AdminPolicy::from_yaml("enable-overlay: yes\nroot-default-capabilities: none\n").unwrap();
    assert_eq!(policy.enable_overlay, OverlayMode::Yes);
    assert_eq!(policy.root_default_capabilities, RootCapsMode::No);
}

#[test]
fn test_lists() {
    let policy = AdminPolicy::from_yaml(
        "limit-container-paths:\n  - /opt/images\nallow-net-groups: [netadm]\nbind-path: []\n",
    )
    .unwrap();
    assert_eq!(policy.limit_container_paths, vec![PathBuf::from("/opt/images")]);
    assert_eq!(policy.allow_net_groups, vec!["netadm"]);
    assert!(policy.bind_path.is_empty());
}

#[test]
fn test_capability_table_lists() {
    let table = CapabilityConfig::from_json(
        r#"{"users": {"alice": ["CAP_NET_RAW"]}, "groups": {"wheel": ["CAP_KILL"]}}"#,
    )
    .unwrap();
    assert_eq!(table.list_user_caps("alice"), vec!["CAP_NET_RAW"]);
    assert!(table.list_user_caps("bob").is_empty());
    assert_eq!(table.list_group_caps("wheel"), vec!["CAP_KILL"]);
    assert_eq!(CapabilityConfig::from_json("").unwrap(), CapabilityConfig::default());
}

// =============================================================================
// Source Tests
// =============================================================================

#[test]
fn test_override_ignored_by_setuid_install() {
    let base = sources(Path::new("/etc/stagehand"));
    let user_file = Path::new("/home/alice/my.conf");

    let unprivileged = base.clone().with_override(Some(user_file), false, 1000);
    assert_eq!(unprivileged.config_file, user_file);

    let setuid = base.clone().with_override(Some(user_file), true, 1000);
    assert_eq!(setuid.config_file, base.config_file);

    let setuid_root = base.with_override(Some(user_file), true, 0);
    assert_eq!(setuid_root.config_file, user_file);
}

#[test]
fn test_load_without_capability_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("stagehand.conf"), "allow-ipc-ns: no\n").unwrap();

    let loaded = sources(dir.path()).load(false).unwrap();
    assert!(!loaded.file.allow_ipc_ns);
    assert_eq!(loaded.capabilities, CapabilityConfig::default());
    assert_eq!(loaded.subuid_file, dir.path().join("subuid"));
}

#[test]
fn test_unparsable_policy() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("stagehand.conf"), "allow-setuid: [1, 2\n").unwrap();
    let err = sources(dir.path()).load(false).unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
}

#[test]
fn test_setuid_load_requires_root_ownership() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("stagehand.conf"), "").unwrap();

    let result = sources(dir.path()).load(true);
    if nix::unistd::geteuid().is_root() {
        result.unwrap();
    } else {
        assert_eq!(result.unwrap_err().category(), ErrorCategory::PolicyIntegrity);
    }
}

#[test]
fn test_ensure_root_owned_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = ensure_root_owned(&dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, Error::PolicyIntegrity { .. }));
}
