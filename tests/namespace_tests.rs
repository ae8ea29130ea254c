//! Tests for namespace module.
//!
//! Covers administrator toggles, the network namespace join rules and the
//! serialized form of namespace requests.

use stagehand::Error;
use stagehand::identity::{GroupEntry, Identity};
use stagehand::namespace::{
    Namespace, NamespaceSet, NamespaceType, apply_policy, authorize_netns_join,
};
use stagehand::policy::AdminPolicy;
use tempfile::TempDir;

fn identity(uid: u32, name: &str, group: Option<(u32, &str)>) -> Identity {
    Identity {
        uid,
        gid: uid,
        euid: uid,
        username: name.to_string(),
        home: format!("/home/{}", name),
        shell: "/bin/sh".to_string(),
        gecos: String::new(),
        groups: group
            .map(|(gid, name)| GroupEntry {
                gid,
                name: name.to_string(),
            })
            .into_iter()
            .collect(),
    }
}

fn set(entries: Vec<Namespace>) -> NamespaceSet {
    entries.into_iter().collect()
}

// =============================================================================
// Policy Toggle Tests
// =============================================================================

#[test]
fn test_mount_namespace_always_added() {
    let mut ns = NamespaceSet::new();
    apply_policy(&mut ns, &AdminPolicy::default(), true, false).unwrap();
    assert!(ns.has(NamespaceType::Mount));
}

#[test]
fn test_disallowed_namespaces_removed_not_fatal() {
    let policy = AdminPolicy {
        allow_ipc_ns: false,
        allow_pid_ns: false,
        allow_uts_ns: false,
        ..Default::default()
    };
    let mut ns = set(vec![
        Namespace::create(NamespaceType::Ipc),
        Namespace::create(NamespaceType::Pid),
        Namespace::create(NamespaceType::Uts),
        Namespace::create(NamespaceType::Network),
    ]);

    apply_policy(&mut ns, &policy, true, true).unwrap();

    assert!(!ns.has(NamespaceType::Ipc));
    assert!(!ns.has(NamespaceType::Pid));
    assert!(!ns.has(NamespaceType::Uts));
    assert!(ns.has(NamespaceType::Network), "network is not governed by these toggles");
}

#[test]
fn test_user_namespace_required_but_disallowed() {
    let policy = AdminPolicy {
        allow_user_ns: false,
        ..Default::default()
    };

    let mut requested = set(vec![Namespace::create(NamespaceType::User)]);
    let err = apply_policy(&mut requested, &policy, true, false).unwrap_err();
    assert!(matches!(err, Error::ConfigurationDisallowed(_)));

    let mut unprivileged = NamespaceSet::new();
    let err = apply_policy(&mut unprivileged, &policy, false, false).unwrap_err();
    assert!(err.to_string().contains("unprivileged installation"));
}

#[test]
fn test_setuid_install_needs_no_user_namespace() {
    let policy = AdminPolicy {
        allow_user_ns: false,
        ..Default::default()
    };
    let mut ns = NamespaceSet::new();
    apply_policy(&mut ns, &policy, true, false).unwrap();
    assert!(!ns.has(NamespaceType::User));
}

// =============================================================================
// Network Join Tests
// =============================================================================

#[test]
fn test_no_network_join_requested() {
    let ns = set(vec![Namespace::create(NamespaceType::Network)]);
    let alice = identity(1000, "alice", None);
    assert_eq!(
        authorize_netns_join(&ns, &AdminPolicy::default(), &alice).unwrap(),
        None
    );
}

#[test]
fn test_root_may_join_any_existing_path() {
    let dir = TempDir::new().unwrap();
    let netns = dir.path().join("netns");
    std::fs::write(&netns, "").unwrap();
    let ns = set(vec![Namespace::join(NamespaceType::Network, &netns)]);

    let root = identity(0, "root", None);
    assert_eq!(
        authorize_netns_join(&ns, &AdminPolicy::default(), &root).unwrap(),
        Some(netns)
    );
}

#[test]
fn test_missing_netns_path_fails() {
    let dir = TempDir::new().unwrap();
    let ns = set(vec![Namespace::join(
        NamespaceType::Network,
        dir.path().join("gone"),
    )]);
    let root = identity(0, "root", None);
    assert!(authorize_netns_join(&ns, &AdminPolicy::default(), &root).is_err());
}

#[test]
fn test_user_needs_path_and_membership() {
    let dir = TempDir::new().unwrap();
    let netns = dir.path().join("netns");
    std::fs::write(&netns, "").unwrap();
    let ns = set(vec![Namespace::join(NamespaceType::Network, &netns)]);
    let alice = identity(1000, "alice", Some((3000, "netusers")));

    // Listed path, no membership.
    let path_only = AdminPolicy {
        allow_netns_paths: vec![netns.clone()],
        ..Default::default()
    };
    assert!(authorize_netns_join(&ns, &path_only, &alice).is_err());

    // Membership, unlisted path.
    let member_only = AdminPolicy {
        allow_net_users: vec!["alice".to_string()],
        ..Default::default()
    };
    assert!(authorize_netns_join(&ns, &member_only, &alice).is_err());

    // Both, via group.
    let both = AdminPolicy {
        allow_netns_paths: vec![netns.clone()],
        allow_net_groups: vec!["netusers".to_string()],
        ..Default::default()
    };
    assert_eq!(authorize_netns_join(&ns, &both, &alice).unwrap(), Some(netns));
}

// =============================================================================
// Serialization Tests
// =============================================================================

#[test]
fn test_namespace_set_json_shape() {
    let ns: NamespaceSet = serde_json::from_str(
        r#"[{"type": "pid"}, {"type": "network", "path": "/run/netns/a"}]"#,
    )
    .unwrap();
    assert!(ns.has(NamespaceType::Pid));
    assert_eq!(
        ns.get(NamespaceType::Network).and_then(|n| n.path.clone()),
        Some("/run/netns/a".into())
    );
}

#[test]
fn test_add_or_replace_keeps_one_per_kind() {
    let mut ns = NamespaceSet::new();
    ns.add_or_replace(Namespace::create(NamespaceType::Network));
    ns.add_or_replace(Namespace::join(NamespaceType::Network, "/run/netns/b"));
    assert_eq!(ns.iter().count(), 1);
    assert_eq!(ns.clone_flags(), 0);
}
