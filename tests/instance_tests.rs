//! Tests for instance module.
//!
//! Drives the integrity proofs through an in-memory procfs view so each
//! proof can be failed in isolation.

use stagehand::Error;
use stagehand::instance::{
    InstanceRecord, ProcView, Proof, ProofContext, join_cgroup_at, verify,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const UID: u32 = 1000;
const GID: u32 = 1000;
const PPID: i32 = 4241;

/// In-memory view of a genuine supervisor process.
struct FakeProc {
    files: HashMap<PathBuf, String>,
    owners: HashMap<PathBuf, (u32, u32)>,
    readable_links: Vec<PathBuf>,
}

impl FakeProc {
    fn genuine() -> Self {
        let parent = PathBuf::from("..").join(PPID.to_string());
        let mut files = HashMap::new();
        files.insert(PathBuf::from("uid_map"), "0 0 4294967295\n".to_string());
        files.insert(
            PathBuf::from("status"),
            format!("Name:\tsinit\nPid:\t4242\nPPid:\t{}\n", PPID),
        );
        files.insert(PathBuf::from("comm"), "sinit\n".to_string());

        let mut owners = HashMap::new();
        owners.insert(PathBuf::from("task"), (UID, GID));
        owners.insert(parent.join("task"), (UID, GID));

        Self {
            files,
            owners,
            readable_links: Vec::new(),
        }
    }
}

impl ProcView for FakeProc {
    fn read_link(&self, rel: &Path) -> io::Result<PathBuf> {
        if self.readable_links.iter().any(|p| p == rel) {
            return Ok(PathBuf::from("/"));
        }
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    }

    fn owner(&self, rel: &Path) -> io::Result<(u32, u32)> {
        self.owners
            .get(rel)
            .copied()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn read_to_string(&self, rel: &Path) -> io::Result<String> {
        self.files
            .get(rel)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

fn ctx() -> ProofContext {
    ProofContext {
        uid: UID,
        gid: GID,
        ppid: PPID,
    }
}

fn failing_proof(view: &FakeProc) -> Option<Proof> {
    Proof::ALL
        .into_iter()
        .find(|p| p.check(view, &ctx()).is_err())
}

// =============================================================================
// Proof Tests
// =============================================================================

#[test]
fn test_genuine_instance_passes() {
    verify(&FakeProc::genuine(), &ctx()).unwrap();
}

#[test]
fn test_missing_uid_map_passes() {
    let mut view = FakeProc::genuine();
    view.files.remove(Path::new("uid_map"));
    verify(&view, &ctx()).unwrap();
}

#[test]
fn test_user_namespace_instance_rejected() {
    let mut view = FakeProc::genuine();
    view.files
        .insert(PathBuf::from("uid_map"), "0 1000 1\n".to_string());
    assert_eq!(failing_proof(&view), Some(Proof::NoUserNamespace));
}

#[test]
fn test_readable_root_link_rejected() {
    let mut view = FakeProc::genuine();
    view.readable_links.push(PathBuf::from("root"));
    assert_eq!(failing_proof(&view), Some(Proof::RootLinkDenied));
}

#[test]
fn test_foreign_task_owner_rejected() {
    let mut view = FakeProc::genuine();
    view.owners.insert(PathBuf::from("task"), (0, 0));
    assert_eq!(failing_proof(&view), Some(Proof::TaskOwnership));

    let err = verify(&view, &ctx()).unwrap_err();
    assert!(matches!(err, Error::InstanceIntegrity(_)));
    assert!(err.to_string().contains("owned by 0:0"));
}

#[test]
fn test_wrong_parent_pid_rejected() {
    let mut view = FakeProc::genuine();
    view.files.insert(
        PathBuf::from("status"),
        "Name:\tsinit\nPPid:\t1\n".to_string(),
    );
    assert_eq!(failing_proof(&view), Some(Proof::ParentPid));
}

#[test]
fn test_readable_parent_root_link_rejected() {
    let mut view = FakeProc::genuine();
    view.readable_links
        .push(PathBuf::from("..").join(PPID.to_string()).join("root"));
    assert_eq!(failing_proof(&view), Some(Proof::ParentRootLinkDenied));
}

#[test]
fn test_foreign_parent_task_owner_rejected() {
    let mut view = FakeProc::genuine();
    view.owners.insert(
        PathBuf::from("..").join(PPID.to_string()).join("task"),
        (UID + 1, GID),
    );
    assert_eq!(failing_proof(&view), Some(Proof::ParentTaskOwnership));
}

#[test]
fn test_wrong_comm_rejected() {
    let mut view = FakeProc::genuine();
    view.files.insert(PathBuf::from("comm"), "bash\n".to_string());
    assert_eq!(failing_proof(&view), Some(Proof::SupervisorComm));
    assert!(verify(&view, &ctx()).unwrap_err().to_string().contains("sinit"));
}

// =============================================================================
// Record Tests
// =============================================================================

#[test]
fn test_record_path_layout() {
    let path = InstanceRecord::path_for(Path::new("/home/alice"), "node1", "web");
    assert_eq!(
        path,
        PathBuf::from("/home/alice/.stagehand/instances/node1/web.json")
    );
}

#[test]
fn test_record_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("web.json");
    std::fs::write(
        &path,
        r#"{"name": "web", "pid": 4242, "ppid": 4241, "userns": true, "config": {}}"#,
    )
    .unwrap();

    let record = InstanceRecord::load(&path).unwrap();
    assert_eq!(record.name, "web");
    assert!(record.user_ns);
    assert!(!record.cgroup);
}

#[test]
fn test_record_load_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("web.json");
    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(
        InstanceRecord::load(&path),
        Err(Error::Serialization(_))
    ));
}

// =============================================================================
// Cgroup Tests
// =============================================================================

#[test]
fn test_join_cgroup_writes_member() {
    let proc_root = TempDir::new().unwrap();
    let cgroup_root = TempDir::new().unwrap();

    let pid_dir = proc_root.path().join("4242");
    std::fs::create_dir_all(&pid_dir).unwrap();
    std::fs::write(pid_dir.join("cgroup"), "0::/user.slice/web\n").unwrap();
    let group = cgroup_root.path().join("user.slice/web");
    std::fs::create_dir_all(&group).unwrap();

    join_cgroup_at(proc_root.path(), cgroup_root.path(), 4242, 777).unwrap();

    let procs = std::fs::read_to_string(group.join("cgroup.procs")).unwrap();
    assert_eq!(procs, "777");
}

#[test]
fn test_join_cgroup_without_unified_entry() {
    let proc_root = TempDir::new().unwrap();
    let cgroup_root = TempDir::new().unwrap();
    let pid_dir = proc_root.path().join("4242");
    std::fs::create_dir_all(&pid_dir).unwrap();
    std::fs::write(pid_dir.join("cgroup"), "1:cpu:/x\n").unwrap();

    let err = join_cgroup_at(proc_root.path(), cgroup_root.path(), 4242, 1).unwrap_err();
    assert!(matches!(err, Error::ResourceUnavailable { .. }));
}
